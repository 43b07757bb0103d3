//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Limits of `VK_KHR_acceleration_structure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureLimits {
    pub max_geometry_count: u64,
    pub max_primitive_count: u64,
    /// Required alignment of scratch buffer addresses.
    pub min_scratch_offset_alignment: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    pub device_type: vk::PhysicalDeviceType,
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    pub supports_buffer_device_address: bool,
    pub supports_acceleration_structure: bool,
    pub supports_deferred_host_operations: bool,

    /// Zeroed when acceleration structures are unsupported.
    pub acceleration_structure: AccelerationStructureLimits,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let has = |name: &CStr| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        };
        let supports_acceleration_structure = has(ash::khr::acceleration_structure::NAME);
        let supports_deferred_host_operations = has(ash::khr::deferred_host_operations::NAME);

        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if supports_acceleration_structure {
            properties2 = properties2.push_next(&mut as_properties);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let acceleration_structure = if supports_acceleration_structure {
            AccelerationStructureLimits {
                max_geometry_count: as_properties.max_geometry_count,
                max_primitive_count: as_properties.max_primitive_count,
                min_scratch_offset_alignment: as_properties
                    .min_acceleration_structure_scratch_offset_alignment,
            }
        } else {
            AccelerationStructureLimits::default()
        };

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let api_version = properties.api_version;
        let has_vulkan_1_2 = vk::api_version_major(api_version) > 1
            || vk::api_version_minor(api_version) >= 2;

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name: CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned(),
            api_version,
            device_type: properties.device_type,
            device_local_memory_mb,
            supports_buffer_device_address: has_vulkan_1_2
                || available_extensions.contains("VK_KHR_buffer_device_address"),
            supports_acceleration_structure,
            supports_deferred_host_operations,
            acceleration_structure,
            available_extensions,
        }
    }

    /// Check if the GPU can build acceleration structures.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        // Synchronization2 barriers need Vulkan 1.3
        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        self.supports_buffer_device_address
            && self.supports_acceleration_structure
            && self.supports_deferred_host_operations
    }

    /// Preference score: discrete GPUs first, then more VRAM.
    pub fn score(&self) -> i64 {
        let type_score = match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
            _ => 0,
        };
        type_score + i64::try_from(self.device_local_memory_mb / 1024).unwrap_or(i64::MAX / 2)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - scratch alignment {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.acceleration_structure.min_scratch_offset_alignment,
        )
    }
}
