//! Acceleration structure build flags.

use bitflags::bitflags;

bitflags! {
    /// Build flags for a BLAS.
    ///
    /// Bit values match `VkBuildAccelerationStructureFlagBitsKHR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        /// The structure may be updated (refit) later.
        const ALLOW_UPDATE = 0x1;
        /// The structure may be compacted after it is built.
        const ALLOW_COMPACTION = 0x2;
        /// Favor trace performance over build time.
        const PREFER_FAST_TRACE = 0x4;
        /// Favor build time over trace performance.
        const PREFER_FAST_BUILD = 0x8;
        /// Minimize scratch and storage memory.
        const LOW_MEMORY = 0x10;
    }
}

impl BuildFlags {
    /// Global flags applied to a batch when the caller has no preference.
    pub const DEFAULT_GLOBAL: Self = Self::PREFER_FAST_TRACE;

    /// Combine an item's own flags with the batch-wide flags.
    pub fn combine(self, global: Self) -> Self {
        self | global
    }

    /// Whether these flags request post-build compaction.
    pub fn allows_compaction(self) -> bool {
        self.contains(Self::ALLOW_COMPACTION)
    }
}
