//! Batch planning results.

use crate::flags::BuildFlags;

/// Device-reported memory requirements for one BLAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BuildSizeRequirement {
    /// Size of the acceleration structure storage.
    pub structure_size: u64,
    /// Scratch memory needed for a full build.
    pub build_scratch_size: u64,
    /// Scratch memory needed for an update.
    pub update_scratch_size: u64,
}

/// Whether an item takes part in the compaction pass.
///
/// Decided once when the batch is planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionPolicy {
    Eligible,
    NotEligible,
}

impl CompactionPolicy {
    pub fn from_flags(flags: BuildFlags) -> Self {
        if flags.allows_compaction() {
            Self::Eligible
        } else {
            Self::NotEligible
        }
    }

    pub fn is_eligible(self) -> bool {
        self == Self::Eligible
    }
}

/// Everything needed to build one item without querying the device again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedItem {
    /// Position of the item in the input sequence.
    pub index: usize,
    /// Item flags combined with the batch-wide flags.
    pub flags: BuildFlags,
    /// One count per geometry, as passed to the size query.
    pub max_primitive_counts: Vec<u32>,
    pub sizes: BuildSizeRequirement,
    pub compaction: CompactionPolicy,
}

impl PlannedItem {
    /// Whether the item has no storage and is never built on the device.
    pub fn is_empty(&self) -> bool {
        self.sizes.structure_size == 0
    }
}

/// Aggregate sizing for a batch of BLAS builds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchPlan {
    /// Sum of all structure sizes.
    pub total_storage_size: u64,
    /// Largest build scratch size of any single item.
    pub peak_scratch_size: u64,
    /// Number of items with `ALLOW_COMPACTION` after combining flags.
    pub compaction_candidates: u32,
    /// Flags ORed into every item.
    pub global_flags: BuildFlags,
    pub items: Vec<PlannedItem>,
}

impl BatchPlan {
    /// Create an empty plan for the given batch-wide flags.
    pub fn new(global_flags: BuildFlags) -> Self {
        Self {
            global_flags,
            ..Default::default()
        }
    }

    /// Add an item and update the running aggregates.
    pub fn push(&mut self, item: PlannedItem) {
        self.total_storage_size += item.sizes.structure_size;
        self.peak_scratch_size = self.peak_scratch_size.max(item.sizes.build_scratch_size);
        if item.compaction.is_eligible() {
            self.compaction_candidates += 1;
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build scratch size of every item, in input order.
    pub fn scratch_sizes(&self) -> Vec<u64> {
        self.items
            .iter()
            .map(|item| item.sizes.build_scratch_size)
            .collect()
    }
}
