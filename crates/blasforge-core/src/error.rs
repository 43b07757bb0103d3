//! Build error types.

use thiserror::Error;

/// Errors reported by a device implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Host memory exhausted.
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Device memory exhausted.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// The logical device was lost.
    #[error("Device lost")]
    DeviceLost,

    /// A wait timed out.
    #[error("Timed out waiting for the device")]
    Timeout,

    /// A result was read before the work producing it completed.
    #[error("Result not ready")]
    NotReady,

    /// Other device failure.
    #[error("{0}")]
    Other(String),
}

/// Result type for device calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised while planning, building or compacting a batch.
#[derive(Error, Debug)]
pub enum BuildError {
    /// The build-size query failed. The device is assumed unusable.
    #[error("Device query failed for item {item}: {source}")]
    DeviceQueryFailed {
        item: usize,
        #[source]
        source: DeviceError,
    },

    /// An item needs more scratch memory than the budget allows on its own.
    #[error("Item {item} needs {required} bytes of scratch, budget is {budget}")]
    UnsatisfiableScratchBudget {
        item: usize,
        required: u64,
        budget: u64,
    },

    /// Recording, submitting or completing a sub-batch build failed.
    #[error("Build command for sub-batch {sub_batch} failed: {source}")]
    BuildCommandFailed {
        sub_batch: usize,
        #[source]
        source: DeviceError,
    },

    /// The compacted-size query for an item failed.
    #[error("Compacted size query for item {item} failed: {source}")]
    CompactionQueryFailed {
        item: usize,
        #[source]
        source: DeviceError,
    },

    /// Buffer or structure creation failed.
    #[error("Allocation of {label} failed: {source}")]
    Allocation {
        label: String,
        #[source]
        source: DeviceError,
    },

    /// Destroying a buffer failed.
    #[error("Releasing {label} failed: {source}")]
    Release {
        label: String,
        #[source]
        source: DeviceError,
    },

    /// Inputs do not match the plan they are executed with.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Illegal item state transition.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, BuildError>;
