//! Headless GPU context.

use crate::capabilities::GpuCapabilities;
use crate::device::QueueConfig;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Vulkan instance, device and allocator for acceleration structure builds.
///
/// Everything created from the context must be dropped before it.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Arc<Mutex<GpuAllocator>>,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    /// Queue used for builds and compaction copies.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            device: Arc::clone(&self.device),
            queue: self.queue,
            queue_family_index: self.queue_family,
        }
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "blasforge".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let (physical_device, capabilities) = match unsafe { select_physical_device(&instance) } {
            Ok(selected) => selected,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };
        tracing::info!("Selected GPU: {}", capabilities.summary());

        let created = unsafe {
            find_compute_queue_family(&instance, physical_device).and_then(|family| {
                create_device(&instance, physical_device, family).map(|device| (family, device))
            })
        };
        let (queue_family, device) = match created {
            Ok(created) => created,
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                return Err(err);
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let device = Arc::new(device);

        let allocator = match unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) } {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(err);
            }
        };

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            queue_family,
            queue,
        })
    }
}

/// Find a compute-capable queue family, preferring one without graphics.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_compute_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let queue_families = instance.get_physical_device_queue_family_properties(physical_device);

    let mut dedicated = None;
    let mut any = None;
    for (i, family) in (0u32..).zip(queue_families.iter()) {
        if !family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
            continue;
        }
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && dedicated.is_none() {
            dedicated = Some(i);
        }
        if any.is_none() {
            any = Some(i);
        }
    }

    dedicated.or(any).ok_or(GpuError::NoSuitableDevice)
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::acceleration_structure::NAME,
        ash::khr::deferred_host_operations::NAME,
    ]
}

/// Create the logical device with acceleration structure features.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority));

    let extension_names: Vec<*const i8> = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut vulkan_1_3_features =
        vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)
}
