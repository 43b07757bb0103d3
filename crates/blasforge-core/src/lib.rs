//! Batched bottom-level acceleration structure builds.
//!
//! This crate provides:
//! - Build inputs and flags for BLAS geometry
//! - Batch planning (storage totals, peak scratch, compaction candidates)
//! - Scratch-budgeted sub-batch execution
//! - Post-build compaction
//! - A device trait with a simulated implementation for tests and dry runs
//!
//! # Example
//!
//! ```
//! use blasforge_core::{
//!     BatchAccelerationBuilder, BuildFlags, BuildRange, BuilderConfig, GeometryBuildInput,
//!     GeometryDesc, SimulatedDevice,
//! };
//!
//! let mut builder = BatchAccelerationBuilder::new(SimulatedDevice::default(), BuilderConfig::default());
//!
//! let mut input = GeometryBuildInput::new("cube", BuildFlags::ALLOW_COMPACTION);
//! input.push_geometry(GeometryDesc::aabbs(0x1000, 24), BuildRange::new(12));
//! let inputs = vec![input];
//!
//! let plan = builder.plan_batch(&inputs, BuildFlags::DEFAULT_GLOBAL)?;
//! let execution = builder.execute_batch(&plan, &inputs, 1 << 20)?;
//! let handles = builder.compact(execution, &plan)?;
//! assert_eq!(handles.len(), 1);
//! builder.destroy_handles(handles)?;
//! # Ok::<(), blasforge_core::BuildError>(())
//! ```

pub mod builder;
pub mod device;
pub mod error;
pub mod flags;
pub mod handle;
pub mod input;
pub mod plan;
pub mod schedule;
pub mod sim;
pub mod state;

pub use builder::{BatchAccelerationBuilder, BatchExecution, BuilderConfig};
pub use device::{AccelerationDevice, BufferUsage, CompletionToken, StructureBuild};
pub use error::{BuildError, DeviceError, DeviceResult, Result};
pub use flags::BuildFlags;
pub use handle::{AccelerationStructureHandle, CompactionOutcome, CompactionSummary, SkipReason};
pub use input::{BuildRange, GeometryBuildInput, GeometryData, GeometryDesc, IndexType, VertexFormat};
pub use plan::{BatchPlan, BuildSizeRequirement, CompactionPolicy, PlannedItem};
pub use schedule::split_sub_batches;
pub use sim::{DeviceEvent, SimulatedDevice, SizeModel};
pub use state::ItemState;
