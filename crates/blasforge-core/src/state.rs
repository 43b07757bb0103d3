//! Per-item build lifecycle.

use crate::error::{BuildError, Result};

/// Lifecycle state of one BLAS in a batch.
///
/// `Planned → Sized → Built → (Compacting → Compacted | Skipped) → Final`.
/// Nothing moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    /// Size requirements are known.
    Planned,
    /// Storage is allocated and the structure object exists.
    Sized,
    /// The build command was submitted.
    Built,
    /// A compacting copy is in progress.
    Compacting,
    /// The structure was replaced by its compacted copy.
    Compacted,
    /// Compaction did not happen; the original structure is kept.
    Skipped,
    /// Owned by the caller.
    Final,
}

impl ItemState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Planned, Self::Sized)
                | (Self::Sized, Self::Built)
                | (Self::Built, Self::Compacting | Self::Skipped)
                | (Self::Compacting, Self::Compacted | Self::Skipped)
                | (Self::Compacted | Self::Skipped, Self::Final)
        )
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: Self) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(BuildError::InvalidState(format!(
                "cannot move from {self:?} to {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}
