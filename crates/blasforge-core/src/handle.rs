//! Built acceleration structures and compaction results.

use std::fmt;

use crate::device::AccelerationDevice;
use crate::error::DeviceError;
use crate::plan::CompactionPolicy;
use crate::state::ItemState;

/// Why an item kept its original structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The item did not request compaction.
    NotEligible,
    /// Nothing was built for the item.
    EmptyGeometry,
    /// The batch was finished without a compaction pass.
    CompactionNotRun,
    /// The compacted-size query failed.
    QueryFailed(DeviceError),
    /// The compacted size was not smaller than the original.
    NoSavings { compacted_size: u64 },
    /// The compacted buffer or structure could not be created.
    AllocationFailed(DeviceError),
    /// The compacting copy could not be submitted or did not complete.
    CopyFailed(DeviceError),
    /// The item's sub-batch failed to build and its storage was released.
    BuildFailed(DeviceError),
}

/// Result of the compaction pass for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    Compacted { from: u64, to: u64 },
    Skipped(SkipReason),
}

/// A bottom-level acceleration structure and the buffer that owns its memory.
///
/// Empty inputs produce a handle with neither structure nor buffer.
pub struct AccelerationStructureHandle<D: AccelerationDevice> {
    pub(crate) index: usize,
    pub(crate) sub_batch: usize,
    pub(crate) label: String,
    pub(crate) structure: Option<D::Structure>,
    pub(crate) buffer: Option<D::Buffer>,
    pub(crate) storage_size: u64,
    pub(crate) state: ItemState,
    pub(crate) compaction: CompactionPolicy,
    pub(crate) outcome: Option<CompactionOutcome>,
}

impl<D: AccelerationDevice> AccelerationStructureHandle<D> {
    /// Position of the source input in the batch.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sub-batch the item was built in.
    pub fn sub_batch(&self) -> usize {
        self.sub_batch
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn structure(&self) -> Option<D::Structure> {
        self.structure
    }

    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.buffer.as_ref()
    }

    /// Size of the backing buffer in bytes.
    pub fn storage_size(&self) -> u64 {
        self.storage_size
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn compaction(&self) -> CompactionPolicy {
        self.compaction
    }

    /// Set once the batch is finished.
    pub fn outcome(&self) -> Option<&CompactionOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.structure.is_none()
    }

    /// Release ownership of the device objects.
    pub fn into_parts(self) -> (Option<D::Structure>, Option<D::Buffer>) {
        (self.structure, self.buffer)
    }
}

impl<D: AccelerationDevice> fmt::Debug for AccelerationStructureHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccelerationStructureHandle")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("structure", &self.structure)
            .field("storage_size", &self.storage_size)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

/// Memory totals over a set of finished handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionSummary {
    /// Storage before compaction.
    pub original_bytes: u64,
    /// Storage after compaction.
    pub final_bytes: u64,
    pub compacted: usize,
    pub skipped: usize,
}

impl CompactionSummary {
    pub fn from_handles<D: AccelerationDevice>(handles: &[AccelerationStructureHandle<D>]) -> Self {
        let mut summary = Self::default();
        for handle in handles {
            summary.final_bytes += handle.storage_size;
            match handle.outcome {
                Some(CompactionOutcome::Compacted { from, .. }) => {
                    summary.original_bytes += from;
                    summary.compacted += 1;
                }
                Some(CompactionOutcome::Skipped(_)) | None => {
                    summary.original_bytes += handle.storage_size;
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    pub fn saved_bytes(&self) -> u64 {
        self.original_bytes.saturating_sub(self.final_bytes)
    }
}
