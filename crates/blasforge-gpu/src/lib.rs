//! Vulkan backend for blasforge.
//!
//! This crate provides:
//! - Headless Vulkan instance and device creation with ray tracing extensions
//! - Acceleration structure capability detection
//! - Memory allocation via gpu-allocator
//! - Command buffer and fence management
//! - [`VulkanAccelerationDevice`], the Vulkan implementation of
//!   [`blasforge_core::AccelerationDevice`]

pub mod capabilities;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod geometry;
pub mod instance;
pub mod memory;
pub mod sync;

pub use capabilities::{AccelerationStructureLimits, GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use device::{QueueConfig, VulkanAccelerationDevice, VulkanCommands, VulkanSizeQuery};
pub use error::{GpuError, Result};
pub use geometry::AabbPositions;
pub use memory::{GpuAllocator, GpuBuffer};
pub use sync::{create_fence, wait_for_fence, VulkanFence};
