//! GPU error types.

use ash::vk;
use blasforge_core::DeviceError;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

impl From<GpuError> for DeviceError {
    fn from(err: GpuError) -> Self {
        match err {
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => Self::OutOfHostMemory,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Self::OutOfDeviceMemory,
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST) => Self::DeviceLost,
            GpuError::Vulkan(vk::Result::TIMEOUT) => Self::Timeout,
            GpuError::Vulkan(vk::Result::NOT_READY) => Self::NotReady,
            other => Self::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_results_map_to_device_errors() {
        let cases = [
            (vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, DeviceError::OutOfDeviceMemory),
            (vk::Result::ERROR_OUT_OF_HOST_MEMORY, DeviceError::OutOfHostMemory),
            (vk::Result::ERROR_DEVICE_LOST, DeviceError::DeviceLost),
            (vk::Result::TIMEOUT, DeviceError::Timeout),
            (vk::Result::NOT_READY, DeviceError::NotReady),
        ];
        for (result, expected) in cases {
            assert_eq!(DeviceError::from(GpuError::from(result)), expected);
        }
    }

    #[test]
    fn other_errors_keep_their_message() {
        let err = DeviceError::from(GpuError::AllocationFailed("heap full".to_string()));
        assert_eq!(
            err,
            DeviceError::Other("Memory allocation failed: heap full".to_string())
        );
    }
}
