//! Headless Vulkan instance creation.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Instance extensions. No surface is ever created.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    let extensions = vec![
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ];

    extensions
}

/// Validation layers to enable on request.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"blasforge")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    let available_layers = entry.enumerate_instance_layer_properties()?;
    let mut layer_names: Vec<*const i8> = Vec::with_capacity(layers.len());
    for layer in layers {
        let found = available_layers
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == layer);
        if found {
            layer_names.push(layer.as_ptr());
        } else {
            tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Select the best physical device that can build acceleration structures.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, GpuCapabilities)> {
    let devices = instance.enumerate_physical_devices()?;

    let mut best = None;
    let mut best_score = 0i64;

    for device in devices {
        let capabilities = GpuCapabilities::query(instance, device);
        if !capabilities.meets_requirements() {
            tracing::debug!("Skipping GPU: {}", capabilities.summary());
            continue;
        }

        let score = capabilities.score();
        if best.is_none() || score > best_score {
            best_score = score;
            best = Some((device, capabilities));
        }
    }

    best.ok_or(GpuError::NoSuitableDevice)
}
