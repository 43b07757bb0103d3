//! Command buffer management.

use crate::error::Result;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Command pool shared between the device and in-flight submissions.
///
/// The pool is destroyed when the last owner drops, so command buffers held
/// by pending fences stay valid after the device wrapper is gone.
pub struct CommandPool {
    device: Arc<ash::Device>,
    pool: Mutex<vk::CommandPool>,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Arc<Self>> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Arc::new(Self {
            device,
            pool: Mutex::new(pool),
            queue_family,
        }))
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single primary command buffer.
    pub fn allocate(&self) -> Result<vk::CommandBuffer> {
        let pool = self.pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        Ok(buffers[0])
    }

    /// Free a command buffer allocated from this pool.
    ///
    /// # Safety
    /// The command buffer must not be pending execution.
    pub unsafe fn free(&self, cmd: vk::CommandBuffer) {
        let pool = self.pool.lock();
        self.device.free_command_buffers(*pool, &[cmd]);
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(*self.pool.get_mut(), None);
        }
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default().command_buffers(command_buffers);
    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}
