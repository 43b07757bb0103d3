//! Vulkan implementation of [`AccelerationDevice`].

use crate::command::{begin_command_buffer, end_command_buffer, submit_command_buffers, CommandPool};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::geometry::{self, align_up, STRUCTURE_SIZE_ALIGNMENT};
use crate::memory::{GpuAllocator, GpuBuffer};
use crate::sync::{create_fence, VulkanFence};
use ash::vk;
use blasforge_core::{
    AccelerationDevice, BufferUsage, BuildFlags, BuildSizeRequirement, DeviceError, DeviceResult,
    GeometryDesc, StructureBuild,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Queue that receives build and compaction submissions.
#[derive(Clone)]
pub struct QueueConfig {
    pub device: Arc<ash::Device>,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
}

/// A command buffer in the recording state.
pub struct VulkanCommands {
    cmd: vk::CommandBuffer,
}

impl VulkanCommands {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

/// Query pool holding compacted sizes, one query per structure.
pub struct VulkanSizeQuery {
    pool: vk::QueryPool,
    count: u32,
}

/// Builds and compacts bottom-level acceleration structures on one queue.
///
/// Must be dropped before the [`GpuContext`] it was created from.
pub struct VulkanAccelerationDevice {
    device: Arc<ash::Device>,
    as_loader: ash::khr::acceleration_structure::Device,
    allocator: Arc<Mutex<GpuAllocator>>,
    pool: Arc<CommandPool>,
    queue: vk::Queue,
    scratch_alignment: u64,
}

impl VulkanAccelerationDevice {
    /// Create a device on an explicit queue.
    ///
    /// # Safety
    /// - The instance, device and queue must be valid and outlive the result.
    /// - The device must have `VK_KHR_acceleration_structure` and buffer
    ///   device address enabled.
    pub unsafe fn new(
        instance: &ash::Instance,
        queue: QueueConfig,
        allocator: Arc<Mutex<GpuAllocator>>,
        scratch_alignment: u64,
    ) -> Result<Self> {
        let as_loader = ash::khr::acceleration_structure::Device::new(instance, &queue.device);
        let pool = CommandPool::new(
            Arc::clone(&queue.device),
            queue.queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;

        Ok(Self {
            device: queue.device,
            as_loader,
            allocator,
            pool,
            queue: queue.queue,
            scratch_alignment,
        })
    }

    /// Create a device on the context's compute queue.
    pub fn from_context(context: &GpuContext) -> Result<Self> {
        let alignment = context
            .capabilities()
            .acceleration_structure
            .min_scratch_offset_alignment;
        unsafe {
            Self::new(
                context.instance(),
                context.queue_config(),
                Arc::clone(context.allocator()),
                u64::from(alignment),
            )
        }
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Device address of a built structure, for TLAS instances.
    pub fn structure_address(&self, structure: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(structure);
        unsafe { self.as_loader.get_acceleration_structure_device_address(&info) }
    }

    /// Aligned start of the scratch region inside `buffer`.
    fn scratch_address(&self, buffer: &GpuBuffer, offset: u64) -> vk::DeviceAddress {
        align_up(buffer.device_address(&self.device), self.scratch_alignment) + offset
    }

    /// Order acceleration structure builds against everything recorded before.
    ///
    /// # Safety
    /// The command buffer must be recording.
    unsafe fn build_barrier(&self, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .dst_access_mask(
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR
                    | vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
            );

        let dependency_info =
            vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));

        self.device.cmd_pipeline_barrier2(cmd, &dependency_info);
    }
}

impl AccelerationDevice for VulkanAccelerationDevice {
    type Buffer = GpuBuffer;
    type Structure = vk::AccelerationStructureKHR;
    type Commands = VulkanCommands;
    type Fence = VulkanFence;
    type SizeQuery = VulkanSizeQuery;

    fn query_build_sizes(
        &self,
        geometries: &[GeometryDesc],
        max_primitive_counts: &[u32],
        flags: BuildFlags,
    ) -> DeviceResult<BuildSizeRequirement> {
        if geometries.len() != max_primitive_counts.len() {
            return Err(DeviceError::Other(format!(
                "{} geometries but {} primitive counts",
                geometries.len(),
                max_primitive_counts.len()
            )));
        }

        let vk_geometries: Vec<_> = geometries.iter().map(geometry::geometry).collect();
        let build_info = geometry::build_info(&vk_geometries, flags);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.as_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                max_primitive_counts,
                &mut sizes,
            );
        }

        Ok(BuildSizeRequirement {
            structure_size: align_up(sizes.acceleration_structure_size, STRUCTURE_SIZE_ALIGNMENT),
            build_scratch_size: align_up(sizes.build_scratch_size, self.scratch_alignment),
            update_scratch_size: align_up(sizes.update_scratch_size, self.scratch_alignment),
        })
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        label: &str,
    ) -> DeviceResult<GpuBuffer> {
        let (usage, size) = match usage {
            BufferUsage::AccelerationStorage => (
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                size,
            ),
            // Padded so the base address can be aligned up.
            BufferUsage::Scratch => (
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                size + self.scratch_alignment,
            ),
        };

        let buffer = self
            .allocator
            .lock()
            .create_buffer(size, usage, MemoryLocation::GpuOnly, label)?;
        tracing::trace!(label, size, "Created buffer");
        Ok(buffer)
    }

    fn destroy_buffer(&mut self, mut buffer: GpuBuffer) -> DeviceResult<()> {
        self.allocator.lock().free_buffer(&mut buffer)?;
        Ok(())
    }

    fn create_structure(
        &mut self,
        buffer: &GpuBuffer,
        size: u64,
    ) -> DeviceResult<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .offset(0)
            .size(size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);

        let structure = unsafe { self.as_loader.create_acceleration_structure(&create_info, None) }
            .map_err(GpuError::from)?;
        Ok(structure)
    }

    fn destroy_structure(&mut self, structure: vk::AccelerationStructureKHR) {
        unsafe { self.as_loader.destroy_acceleration_structure(structure, None) };
    }

    fn begin_commands(&mut self) -> DeviceResult<VulkanCommands> {
        let cmd = self.pool.allocate()?;
        let begun = unsafe {
            begin_command_buffer(&self.device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        };
        if let Err(err) = begun {
            unsafe { self.pool.free(cmd) };
            return Err(err.into());
        }
        Ok(VulkanCommands { cmd })
    }

    fn discard_commands(&mut self, commands: VulkanCommands) {
        unsafe { self.pool.free(commands.cmd) };
    }

    fn cmd_build_structures(
        &mut self,
        commands: &mut VulkanCommands,
        builds: &[StructureBuild<'_, Self>],
    ) -> DeviceResult<()> {
        let geometries: Vec<Vec<_>> = builds
            .iter()
            .map(|build| build.input.geometries().iter().map(geometry::geometry).collect())
            .collect();
        let ranges: Vec<Vec<_>> = builds
            .iter()
            .map(|build| build.input.ranges().iter().map(geometry::build_range).collect())
            .collect();

        let infos: Vec<_> = builds
            .iter()
            .zip(&geometries)
            .map(|(build, geometries)| {
                let scratch_address = build
                    .scratch
                    .map_or(0, |scratch| self.scratch_address(scratch, build.scratch_offset));
                geometry::build_info(geometries, build.flags)
                    .dst_acceleration_structure(build.destination)
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_address,
                    })
            })
            .collect();
        let range_slices: Vec<&[_]> = ranges.iter().map(Vec::as_slice).collect();

        unsafe {
            // The scratch buffer is shared with the previous sub-batch.
            self.build_barrier(commands.cmd);
            self.as_loader
                .cmd_build_acceleration_structures(commands.cmd, &infos, &range_slices);
            self.build_barrier(commands.cmd);
        }
        Ok(())
    }

    fn cmd_query_compacted_sizes(
        &mut self,
        commands: &mut VulkanCommands,
        structures: &[vk::AccelerationStructureKHR],
    ) -> DeviceResult<VulkanSizeQuery> {
        let count = u32::try_from(structures.len())
            .map_err(|_| DeviceError::Other("too many structures in one query".to_string()))?;

        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);
        let pool =
            unsafe { self.device.create_query_pool(&create_info, None) }.map_err(GpuError::from)?;

        unsafe {
            self.device.cmd_reset_query_pool(commands.cmd, pool, 0, count);
            self.as_loader.cmd_write_acceleration_structures_properties(
                commands.cmd,
                structures,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                0,
            );
        }

        Ok(VulkanSizeQuery { pool, count })
    }

    fn cmd_copy_compacted(
        &mut self,
        commands: &mut VulkanCommands,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
    ) -> DeviceResult<()> {
        let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src)
            .dst(dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);

        unsafe {
            self.as_loader
                .cmd_copy_acceleration_structure(commands.cmd, &copy_info);
        }
        Ok(())
    }

    fn submit(&mut self, commands: VulkanCommands) -> DeviceResult<VulkanFence> {
        let cmd = commands.cmd;
        let submitted = unsafe {
            end_command_buffer(&self.device, cmd).and_then(|()| {
                let fence = create_fence(&self.device, false)?;
                match submit_command_buffers(&self.device, self.queue, &[cmd], fence) {
                    Ok(()) => Ok(fence),
                    Err(err) => {
                        self.device.destroy_fence(fence, None);
                        Err(err)
                    }
                }
            })
        };

        match submitted {
            Ok(fence) => Ok(VulkanFence::new(
                Arc::clone(&self.device),
                Arc::clone(&self.pool),
                fence,
                cmd,
            )),
            Err(err) => {
                unsafe { self.pool.free(cmd) };
                Err(err.into())
            }
        }
    }

    fn read_compacted_size(&mut self, query: &VulkanSizeQuery, slot: usize) -> DeviceResult<u64> {
        let first_query = u32::try_from(slot)
            .ok()
            .filter(|&first| first < query.count)
            .ok_or_else(|| DeviceError::Other(format!("query slot {slot} out of range")))?;

        let mut size = [0u64; 1];
        unsafe {
            self.device.get_query_pool_results(
                query.pool,
                first_query,
                &mut size,
                vk::QueryResultFlags::TYPE_64,
            )
        }
        .map_err(GpuError::from)?;

        Ok(size[0])
    }

    fn release_size_query(&mut self, query: VulkanSizeQuery) {
        unsafe { self.device.destroy_query_pool(query.pool, None) };
    }

    fn scratch_padding(&self) -> u64 {
        self.scratch_alignment
    }
}
