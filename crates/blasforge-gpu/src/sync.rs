//! Synchronization primitives.

use crate::command::CommandPool;
use crate::error::{GpuError, Result};
use ash::vk;
use blasforge_core::{CompletionToken, DeviceResult};
use std::sync::Arc;

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Fence of one queue submission.
///
/// Owns the submitted command buffer. Dropping the fence blocks until the
/// submission finished, then frees both.
pub struct VulkanFence {
    device: Arc<ash::Device>,
    pool: Arc<CommandPool>,
    fence: vk::Fence,
    cmd: vk::CommandBuffer,
}

impl VulkanFence {
    pub(crate) fn new(
        device: Arc<ash::Device>,
        pool: Arc<CommandPool>,
        fence: vk::Fence,
        cmd: vk::CommandBuffer,
    ) -> Self {
        Self {
            device,
            pool,
            fence,
            cmd,
        }
    }

    /// Get the raw fence handle.
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl CompletionToken for VulkanFence {
    fn wait(&self, timeout_ns: u64) -> DeviceResult<()> {
        unsafe { wait_for_fence(&self.device, self.fence, timeout_ns) }.map_err(Into::into)
    }

    fn poll(&self) -> DeviceResult<bool> {
        unsafe { self.device.get_fence_status(self.fence) }
            .map_err(|err| GpuError::from(err).into())
    }
}

impl Drop for VulkanFence {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = wait_for_fence(&self.device, self.fence, u64::MAX) {
                tracing::warn!("Waiting for dropped submission failed: {err}");
            }
            self.pool.free(self.cmd);
            self.device.destroy_fence(self.fence, None);
        }
    }
}
