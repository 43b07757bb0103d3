//! Device capabilities consumed by the batch builder.
//!
//! The builder never talks to a GPU directly. Everything it needs (size
//! queries, allocation, command recording and submission) goes through
//! [`AccelerationDevice`], so it can run against Vulkan or a simulation.

use crate::error::DeviceResult;
use crate::flags::BuildFlags;
use crate::input::{GeometryBuildInput, GeometryDesc};
use crate::plan::BuildSizeRequirement;

/// How a buffer is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Backing storage of an acceleration structure.
    AccelerationStorage,
    /// Build scratch memory.
    Scratch,
}

/// Completion signal for submitted work.
pub trait CompletionToken {
    /// Block until the work completes or `timeout_ns` elapses.
    fn wait(&self, timeout_ns: u64) -> DeviceResult<()>;

    /// Check for completion without blocking.
    fn poll(&self) -> DeviceResult<bool>;
}

/// One structure build inside a batched build command.
pub struct StructureBuild<'a, D: AccelerationDevice + ?Sized> {
    pub input: &'a GeometryBuildInput,
    /// Combined item and batch flags.
    pub flags: BuildFlags,
    pub destination: D::Structure,
    /// Shared scratch buffer; `None` when the whole sub-batch needs no scratch.
    pub scratch: Option<&'a D::Buffer>,
    /// Start of this build's region inside `scratch`.
    pub scratch_offset: u64,
}

/// Device operations needed to build and compact acceleration structures.
pub trait AccelerationDevice {
    /// Device buffer owning memory.
    type Buffer;
    /// Acceleration structure object.
    type Structure: Copy + PartialEq + std::fmt::Debug;
    /// Command buffer in the recording state.
    type Commands;
    /// Completion signal returned by [`Self::submit`].
    type Fence: CompletionToken;
    /// Pending compacted-size query results.
    type SizeQuery;

    /// Query storage and scratch sizes for a bottom-level build.
    fn query_build_sizes(
        &self,
        geometries: &[GeometryDesc],
        max_primitive_counts: &[u32],
        flags: BuildFlags,
    ) -> DeviceResult<BuildSizeRequirement>;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage, label: &str)
        -> DeviceResult<Self::Buffer>;

    /// Destroy a buffer. No pending command may reference it.
    fn destroy_buffer(&mut self, buffer: Self::Buffer) -> DeviceResult<()>;

    /// Create a bottom-level structure occupying `size` bytes of `buffer`.
    fn create_structure(&mut self, buffer: &Self::Buffer, size: u64)
        -> DeviceResult<Self::Structure>;

    fn destroy_structure(&mut self, structure: Self::Structure);

    fn begin_commands(&mut self) -> DeviceResult<Self::Commands>;

    /// Drop commands that will not be submitted.
    fn discard_commands(&mut self, commands: Self::Commands);

    /// Record a single batched build of all `builds`.
    fn cmd_build_structures(
        &mut self,
        commands: &mut Self::Commands,
        builds: &[StructureBuild<'_, Self>],
    ) -> DeviceResult<()>;

    /// Record compacted-size queries for `structures`, one slot each, after the builds.
    fn cmd_query_compacted_sizes(
        &mut self,
        commands: &mut Self::Commands,
        structures: &[Self::Structure],
    ) -> DeviceResult<Self::SizeQuery>;

    /// Record a compacting copy from `src` into `dst`.
    fn cmd_copy_compacted(
        &mut self,
        commands: &mut Self::Commands,
        src: Self::Structure,
        dst: Self::Structure,
    ) -> DeviceResult<()>;

    /// Finish recording and submit to the build queue.
    fn submit(&mut self, commands: Self::Commands) -> DeviceResult<Self::Fence>;

    /// Read one slot of a size query. Only valid once its submission completed.
    fn read_compacted_size(&mut self, query: &Self::SizeQuery, slot: usize) -> DeviceResult<u64>;

    fn release_size_query(&mut self, query: Self::SizeQuery);

    /// Bytes a scratch allocation takes beyond the size it was asked for.
    ///
    /// The builder subtracts this from the scratch budget before splitting.
    fn scratch_padding(&self) -> u64 {
        0
    }
}
