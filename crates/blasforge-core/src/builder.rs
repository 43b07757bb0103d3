//! Batched BLAS construction with optional compaction.
//!
//! The builder runs in three steps, always in this order:
//!
//! 1. [`BatchAccelerationBuilder::plan_batch`] queries the device for the size
//!    of every item and aggregates storage, peak scratch and the number of
//!    compaction candidates.
//! 2. [`BatchAccelerationBuilder::execute_batch`] allocates one storage buffer
//!    per item, splits the batch into sub-batches that fit the scratch budget,
//!    and submits one batched build per sub-batch.
//! 3. [`BatchAccelerationBuilder::compact`] (or [`BatchAccelerationBuilder::finish`])
//!    waits for each sub-batch, copies compaction candidates into exactly
//!    sized buffers, and hands the structures to the caller in input order.

use std::ops::Range;

use tracing::{debug, error, info, warn};

use crate::device::{AccelerationDevice, BufferUsage, CompletionToken, StructureBuild};
use crate::error::{BuildError, DeviceError, DeviceResult, Result};
use crate::flags::BuildFlags;
use crate::handle::{AccelerationStructureHandle, CompactionOutcome, CompactionSummary, SkipReason};
use crate::input::GeometryBuildInput;
use crate::plan::{BatchPlan, BuildSizeRequirement, CompactionPolicy, PlannedItem};
use crate::schedule::{split_sub_batches, sub_batch_scratch};
use crate::state::ItemState;

/// Builder configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Timeout for every fence wait, in nanoseconds.
    pub fence_timeout_ns: u64,
    /// Prefix for buffer debug labels.
    pub label_prefix: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ns: u64::MAX,
            label_prefix: "blas".to_string(),
        }
    }
}

impl BuilderConfig {
    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the buffer label prefix.
    pub fn with_label_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.label_prefix = prefix.into();
        self
    }
}

/// Work submitted for one sub-batch.
struct SubBatch<D: AccelerationDevice> {
    items: Range<usize>,
    fence: Option<D::Fence>,
    size_query: Option<D::SizeQuery>,
    /// Item index for each slot of `size_query`.
    query_items: Vec<usize>,
    failure: Option<DeviceError>,
}

/// A batch whose builds have been submitted but not yet completed.
///
/// Owns every structure, the shared scratch buffer and the per-sub-batch
/// fences until it is passed to [`BatchAccelerationBuilder::compact`] or
/// [`BatchAccelerationBuilder::finish`].
pub struct BatchExecution<D: AccelerationDevice> {
    handles: Vec<AccelerationStructureHandle<D>>,
    sub_batches: Vec<SubBatch<D>>,
    scratch: Option<D::Buffer>,
}

impl<D: AccelerationDevice> BatchExecution<D> {
    /// Handles in input order.
    pub fn handles(&self) -> &[AccelerationStructureHandle<D>] {
        &self.handles
    }

    /// Item ranges of the sub-batches, in submission order.
    pub fn sub_batches(&self) -> Vec<Range<usize>> {
        self.sub_batches.iter().map(|s| s.items.clone()).collect()
    }

    /// Sub-batches whose build could not be submitted.
    pub fn failed_sub_batches(&self) -> Vec<usize> {
        self.sub_batches
            .iter()
            .enumerate()
            .filter(|(_, s)| s.failure.is_some())
            .map(|(i, _)| i)
            .collect()
    }

    /// Whether every submitted build has completed, without blocking.
    pub fn is_complete(&self) -> DeviceResult<bool> {
        for sub_batch in &self.sub_batches {
            if let Some(fence) = &sub_batch.fence {
                if !fence.poll()? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Device objects held back until the fences of work using them signal.
struct Retired<D: AccelerationDevice> {
    fences: Vec<D::Fence>,
    structures: Vec<D::Structure>,
    buffers: Vec<(String, D::Buffer)>,
    size_queries: Vec<D::SizeQuery>,
}

impl<D: AccelerationDevice> Default for Retired<D> {
    fn default() -> Self {
        Self {
            fences: Vec::new(),
            structures: Vec::new(),
            buffers: Vec::new(),
            size_queries: Vec::new(),
        }
    }
}

impl<D: AccelerationDevice> Retired<D> {
    fn push_handle(&mut self, handle: AccelerationStructureHandle<D>) {
        let label = handle.label.clone();
        let (structure, buffer) = handle.into_parts();
        self.structures.extend(structure);
        self.buffers.extend(buffer.map(|buffer| (label, buffer)));
    }
}

/// Plans, builds and compacts batches of bottom-level acceleration structures.
pub struct BatchAccelerationBuilder<D: AccelerationDevice> {
    device: D,
    config: BuilderConfig,
    retired: Vec<Retired<D>>,
}

impl<D: AccelerationDevice> BatchAccelerationBuilder<D> {
    pub fn new(device: D, config: BuilderConfig) -> Self {
        Self {
            device,
            config,
            retired: Vec::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Give the device back.
    ///
    /// Resources still held back by [`Self::retired_count`] are leaked.
    pub fn into_device(self) -> D {
        if !self.retired.is_empty() {
            warn!(
                retired = self.retired.len(),
                "Dropping BLAS builder with unreleased resources"
            );
        }
        self.device
    }

    /// Released batches whose memory is held back because a fence wait failed.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Wait again on held-back work and free whatever has completed.
    pub fn reclaim_retired(&mut self) -> Result<()> {
        let mut first_error = None;
        for retired in std::mem::take(&mut self.retired) {
            if let Err(err) = self.release(retired) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Size every input and aggregate the batch requirements.
    ///
    /// `global_flags` are ORed into each item's own flags. Inputs without
    /// geometry are kept in the plan with a zero size so indices stay aligned.
    pub fn plan_batch(
        &self,
        inputs: &[GeometryBuildInput],
        global_flags: BuildFlags,
    ) -> Result<BatchPlan> {
        if inputs.is_empty() {
            warn!("Planning an empty BLAS batch");
        }

        let mut plan = BatchPlan::new(global_flags);
        for (index, input) in inputs.iter().enumerate() {
            let flags = input.flags().combine(global_flags);
            let max_primitive_counts = input.max_primitive_counts();

            let sizes = if input.is_empty() {
                BuildSizeRequirement::default()
            } else {
                self.device
                    .query_build_sizes(input.geometries(), &max_primitive_counts, flags)
                    .map_err(|source| BuildError::DeviceQueryFailed {
                        item: index,
                        source,
                    })?
            };

            debug!(
                item = index,
                label = input.label(),
                structure_size = sizes.structure_size,
                scratch_size = sizes.build_scratch_size,
                "Sized BLAS"
            );

            plan.push(PlannedItem {
                index,
                flags,
                max_primitive_counts,
                sizes,
                compaction: CompactionPolicy::from_flags(flags),
            });
        }

        info!(
            items = plan.len(),
            total_storage = plan.total_storage_size,
            peak_scratch = plan.peak_scratch_size,
            compaction_candidates = plan.compaction_candidates,
            "Planned BLAS batch"
        );

        Ok(plan)
    }

    /// Allocate storage and submit the builds of a planned batch.
    ///
    /// Sub-batches are submitted back-to-back and share one scratch buffer.
    /// Sub-batch failures are recorded on the execution and reported by
    /// [`Self::compact`] or [`Self::finish`].
    pub fn execute_batch(
        &mut self,
        plan: &BatchPlan,
        inputs: &[GeometryBuildInput],
        scratch_budget: u64,
    ) -> Result<BatchExecution<D>> {
        if plan.len() != inputs.len() {
            return Err(BuildError::InvalidInput(format!(
                "plan has {} items but {} inputs were given",
                plan.len(),
                inputs.len()
            )));
        }

        let scratch_sizes = plan.scratch_sizes();
        let padding = self.device.scratch_padding();
        let ranges = split_sub_batches(&scratch_sizes, scratch_budget.saturating_sub(padding))?;
        let scratch_size = ranges
            .iter()
            .map(|range| sub_batch_scratch(&scratch_sizes, range.clone()))
            .max()
            .unwrap_or(0);

        info!(
            items = plan.len(),
            sub_batches = ranges.len(),
            scratch_size,
            scratch_budget,
            padding,
            "Executing BLAS batch"
        );

        let mut handles = Vec::with_capacity(plan.len());
        for (sub_batch, range) in ranges.iter().enumerate() {
            for index in range.clone() {
                let item = &plan.items[index];
                let mut handle = AccelerationStructureHandle {
                    index,
                    sub_batch,
                    label: format!("{}[{index}] {}", self.config.label_prefix, inputs[index].label()),
                    structure: None,
                    buffer: None,
                    storage_size: 0,
                    state: ItemState::Planned,
                    compaction: item.compaction,
                    outcome: None,
                };

                if !item.is_empty() {
                    match self.allocate_structure(item.sizes.structure_size, &handle.label) {
                        Ok((structure, buffer)) => {
                            handle.structure = Some(structure);
                            handle.buffer = Some(buffer);
                            handle.storage_size = item.sizes.structure_size;
                        }
                        Err(source) => {
                            let label = handle.label;
                            self.release_handles(handles);
                            return Err(BuildError::Allocation { label, source });
                        }
                    }
                }

                handle.state.advance(ItemState::Sized)?;
                handles.push(handle);
            }
        }

        let scratch = if scratch_size > 0 {
            let label = format!("{} scratch", self.config.label_prefix);
            match self
                .device
                .create_buffer(scratch_size, BufferUsage::Scratch, &label)
            {
                Ok(buffer) => Some(buffer),
                Err(source) => {
                    self.release_handles(handles);
                    return Err(BuildError::Allocation { label, source });
                }
            }
        } else {
            None
        };

        let mut sub_batches = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.into_iter().enumerate() {
            let mut sub_batch = SubBatch {
                items: range.clone(),
                fence: None,
                size_query: None,
                query_items: Vec::new(),
                failure: None,
            };

            match self.submit_builds(plan, inputs, &handles, range.clone(), scratch.as_ref()) {
                Ok(Some((fence, size_query, query_items))) => {
                    debug!(sub_batch = index, items = ?range, "Submitted BLAS sub-batch");
                    sub_batch.fence = Some(fence);
                    sub_batch.size_query = size_query;
                    sub_batch.query_items = query_items;
                }
                Ok(None) => {}
                Err(source) => {
                    error!(sub_batch = index, items = ?range, "BLAS sub-batch build failed: {source}");
                    sub_batch.failure = Some(source);
                }
            }

            for handle in &mut handles[range] {
                handle.state.advance(ItemState::Built)?;
            }
            sub_batches.push(sub_batch);
        }

        Ok(BatchExecution {
            handles,
            sub_batches,
            scratch,
        })
    }

    /// Wait for the builds and compact every eligible structure.
    ///
    /// Each sub-batch is compacted as soon as its own fence signals. A failed
    /// compacted-size query only skips that item; a failed sub-batch build
    /// releases the whole batch and is returned as an error, unless it was
    /// removed first with [`Self::discard_failed`].
    ///
    /// When a fence wait fails, the batch's memory is held back until
    /// [`Self::reclaim_retired`] observes the outstanding work complete.
    pub fn compact(
        &mut self,
        execution: BatchExecution<D>,
        plan: &BatchPlan,
    ) -> Result<Vec<AccelerationStructureHandle<D>>> {
        if plan.len() != execution.handles.len() {
            let message = format!(
                "plan has {} items but the batch has {}",
                plan.len(),
                execution.handles.len()
            );
            self.release_execution(execution, Retired::default());
            return Err(BuildError::InvalidInput(message));
        }
        if let Some(err) = Self::first_failure(&execution) {
            self.release_execution(execution, Retired::default());
            return Err(err);
        }

        let BatchExecution {
            mut handles,
            mut sub_batches,
            scratch,
        } = execution;

        let mut leftovers = Retired::default();
        for index in 0..sub_batches.len() {
            let waited = sub_batches[index]
                .fence
                .as_ref()
                .map_or(Ok(()), |fence| fence.wait(self.config.fence_timeout_ns));
            if let Err(source) = waited {
                let execution = BatchExecution {
                    handles,
                    sub_batches,
                    scratch,
                };
                self.release_execution(execution, leftovers);
                return Err(BuildError::BuildCommandFailed {
                    sub_batch: index,
                    source,
                });
            }

            let compacted = self.compact_sub_batch(
                plan,
                index,
                &sub_batches[index],
                &mut handles,
                &mut leftovers,
            );
            if let Err(err) = compacted {
                let execution = BatchExecution {
                    handles,
                    sub_batches,
                    scratch,
                };
                self.release_execution(execution, leftovers);
                return Err(err);
            }

            if let Some(query) = sub_batches[index].size_query.take() {
                self.device.release_size_query(query);
            }
        }

        self.release_completed(sub_batches, scratch);
        Self::finalize(&mut handles, SkipReason::NotEligible)?;

        let summary = CompactionSummary::from_handles(&handles);
        info!(
            compacted = summary.compacted,
            skipped = summary.skipped,
            "Compacted BLAS from {} KiB to {} KiB",
            summary.original_bytes / 1024,
            summary.final_bytes / 1024
        );

        Ok(handles)
    }

    /// Wait for the builds and take the structures without compacting.
    pub fn finish(
        &mut self,
        execution: BatchExecution<D>,
    ) -> Result<Vec<AccelerationStructureHandle<D>>> {
        if let Some(err) = Self::first_failure(&execution) {
            self.release_execution(execution, Retired::default());
            return Err(err);
        }

        let failed_wait = execution
            .sub_batches
            .iter()
            .enumerate()
            .find_map(|(index, sub_batch)| {
                let fence = sub_batch.fence.as_ref()?;
                fence
                    .wait(self.config.fence_timeout_ns)
                    .err()
                    .map(|source| BuildError::BuildCommandFailed {
                        sub_batch: index,
                        source,
                    })
            });
        if let Some(err) = failed_wait {
            self.release_execution(execution, Retired::default());
            return Err(err);
        }

        let BatchExecution {
            mut handles,
            sub_batches,
            scratch,
        } = execution;
        self.release_completed(sub_batches, scratch);
        Self::finalize(&mut handles, SkipReason::CompactionNotRun)?;

        info!(items = handles.len(), "Finished BLAS batch without compaction");
        Ok(handles)
    }

    /// Release the items of sub-batches whose build could not be submitted.
    ///
    /// Their handles stay in place, empty and skipped, so [`Self::compact`]
    /// and [`Self::finish`] still complete the sub-batches that did build.
    /// Returns one error per discarded sub-batch.
    pub fn discard_failed(&mut self, execution: &mut BatchExecution<D>) -> Result<Vec<BuildError>> {
        let mut failures = Vec::new();
        for (index, sub_batch) in execution.sub_batches.iter_mut().enumerate() {
            let Some(source) = sub_batch.failure.take() else {
                continue;
            };
            warn!(sub_batch = index, items = ?sub_batch.items, "Discarding failed BLAS sub-batch: {source}");

            for handle in &mut execution.handles[sub_batch.items.clone()] {
                if let Some(structure) = handle.structure.take() {
                    self.device.destroy_structure(structure);
                }
                if let Some(buffer) = handle.buffer.take() {
                    if let Err(err) = self.device.destroy_buffer(buffer) {
                        warn!("Failed to release {}: {err}", handle.label);
                    }
                }
                handle.storage_size = 0;
                Self::skip(handle, SkipReason::BuildFailed(source.clone()))?;
            }
            failures.push(BuildError::BuildCommandFailed {
                sub_batch: index,
                source,
            });
        }
        Ok(failures)
    }

    /// Destroy finished structures and their buffers.
    ///
    /// The caller must make sure no pending GPU work references them.
    /// Every handle is attempted; the first failure is returned.
    pub fn destroy_handles(&mut self, handles: Vec<AccelerationStructureHandle<D>>) -> Result<()> {
        let mut first_error = None;
        for handle in handles {
            let label = handle.label.clone();
            let (structure, buffer) = handle.into_parts();
            if let Some(structure) = structure {
                self.device.destroy_structure(structure);
            }
            if let Some(buffer) = buffer {
                if let Err(source) = self.device.destroy_buffer(buffer) {
                    first_error.get_or_insert(BuildError::Release { label, source });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn allocate_structure(&mut self, size: u64, label: &str) -> DeviceResult<(D::Structure, D::Buffer)> {
        let buffer = self
            .device
            .create_buffer(size, BufferUsage::AccelerationStorage, label)?;
        match self.device.create_structure(&buffer, size) {
            Ok(structure) => Ok((structure, buffer)),
            Err(err) => {
                if let Err(release) = self.device.destroy_buffer(buffer) {
                    warn!("Failed to release {label}: {release}");
                }
                Err(err)
            }
        }
    }

    /// Record and submit one batched build; `None` when nothing needs building.
    #[allow(clippy::type_complexity)]
    fn submit_builds(
        &mut self,
        plan: &BatchPlan,
        inputs: &[GeometryBuildInput],
        handles: &[AccelerationStructureHandle<D>],
        range: Range<usize>,
        scratch: Option<&D::Buffer>,
    ) -> DeviceResult<Option<(D::Fence, Option<D::SizeQuery>, Vec<usize>)>> {
        let mut builds = Vec::new();
        let mut candidates = Vec::new();
        let mut query_items = Vec::new();
        let mut scratch_offset = 0;

        for index in range {
            let Some(destination) = handles[index].structure else {
                continue;
            };
            let item = &plan.items[index];
            builds.push(StructureBuild {
                input: &inputs[index],
                flags: item.flags,
                destination,
                scratch,
                scratch_offset,
            });
            scratch_offset += item.sizes.build_scratch_size;

            if item.compaction.is_eligible() {
                candidates.push(destination);
                query_items.push(index);
            }
        }

        if builds.is_empty() {
            return Ok(None);
        }

        let mut commands = self.device.begin_commands()?;
        if let Err(err) = self.device.cmd_build_structures(&mut commands, &builds) {
            self.device.discard_commands(commands);
            return Err(err);
        }

        let size_query = if candidates.is_empty() {
            None
        } else {
            match self.device.cmd_query_compacted_sizes(&mut commands, &candidates) {
                Ok(query) => Some(query),
                Err(err) => {
                    self.device.discard_commands(commands);
                    return Err(err);
                }
            }
        };

        match self.device.submit(commands) {
            Ok(fence) => Ok(Some((fence, size_query, query_items))),
            Err(err) => {
                if let Some(query) = size_query {
                    self.device.release_size_query(query);
                }
                Err(err)
            }
        }
    }

    /// Compact the candidates of one sub-batch whose build fence has signaled.
    fn compact_sub_batch(
        &mut self,
        plan: &BatchPlan,
        sub_batch_index: usize,
        sub_batch: &SubBatch<D>,
        handles: &mut [AccelerationStructureHandle<D>],
        leftovers: &mut Retired<D>,
    ) -> Result<()> {
        let Some(query) = &sub_batch.size_query else {
            return Ok(());
        };

        let mut pending = Vec::new();
        for (slot, &index) in sub_batch.query_items.iter().enumerate() {
            if !plan.items[index].compaction.is_eligible() {
                continue;
            }
            let handle = &mut handles[index];
            handle.state.advance(ItemState::Compacting)?;

            let compacted_size = match self.device.read_compacted_size(query, slot) {
                Ok(size) => size,
                Err(source) => {
                    let err = BuildError::CompactionQueryFailed {
                        item: index,
                        source: source.clone(),
                    };
                    warn!("{err}; keeping the original structure");
                    Self::skip(handle, SkipReason::QueryFailed(source))?;
                    continue;
                }
            };

            if compacted_size == 0 || compacted_size >= handle.storage_size {
                debug!(
                    item = index,
                    size = handle.storage_size,
                    compacted_size,
                    "Compaction would not save memory"
                );
                Self::skip(handle, SkipReason::NoSavings { compacted_size })?;
                continue;
            }

            let label = format!("{} compacted", handle.label);
            match self.allocate_structure(compacted_size, &label) {
                Ok((structure, buffer)) => pending.push((index, structure, buffer, compacted_size)),
                Err(source) => {
                    warn!("Failed to allocate {label}: {source}; keeping the original structure");
                    Self::skip(handle, SkipReason::AllocationFailed(source))?;
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let copies: Vec<_> = pending
            .iter()
            .filter_map(|(index, dst, _, _)| handles[*index].structure.map(|src| (src, *dst)))
            .collect();

        let fence = match self.submit_copies(&copies) {
            Ok(fence) => fence,
            Err(source) => {
                warn!("Compaction copy could not be submitted: {source}");
                let mut first_error = None;
                let mut skipped = Vec::with_capacity(pending.len());
                for (index, structure, buffer, _) in pending {
                    self.device.destroy_structure(structure);
                    if let Err(err) = self.device.destroy_buffer(buffer) {
                        first_error.get_or_insert(BuildError::Release {
                            label: format!("{} compacted", handles[index].label),
                            source: err,
                        });
                    }
                    skipped.push(index);
                }
                for index in skipped {
                    Self::skip(&mut handles[index], SkipReason::CopyFailed(source.clone()))?;
                }
                return first_error.map_or(Ok(()), Err);
            }
        };

        if let Err(source) = fence.wait(self.config.fence_timeout_ns) {
            // The copy may still be running: its targets and fence go back to
            // the caller, which releases them with the rest of the batch.
            let mut skipped = Vec::with_capacity(pending.len());
            for (index, structure, buffer, _) in pending {
                leftovers.structures.push(structure);
                leftovers
                    .buffers
                    .push((format!("{} compacted", handles[index].label), buffer));
                skipped.push(index);
            }
            leftovers.fences.push(fence);
            for index in skipped {
                Self::skip(&mut handles[index], SkipReason::CopyFailed(source.clone()))?;
            }
            return Err(BuildError::BuildCommandFailed {
                sub_batch: sub_batch_index,
                source,
            });
        }
        drop(fence);

        let mut first_error = None;
        for (index, structure, buffer, compacted_size) in pending {
            let handle = &mut handles[index];
            let original_size = handle.storage_size;
            let old_structure = handle.structure.replace(structure);
            let old_buffer = handle.buffer.replace(buffer);
            handle.storage_size = compacted_size;

            if let Some(old) = old_structure {
                self.device.destroy_structure(old);
            }
            if let Some(old) = old_buffer {
                if let Err(source) = self.device.destroy_buffer(old) {
                    first_error.get_or_insert(BuildError::Release {
                        label: handle.label.clone(),
                        source,
                    });
                }
            }

            debug!(
                item = index,
                from = original_size,
                to = compacted_size,
                "Compacted BLAS"
            );
            handle.state.advance(ItemState::Compacted)?;
            handle.outcome = Some(CompactionOutcome::Compacted {
                from: original_size,
                to: compacted_size,
            });
        }

        first_error.map_or(Ok(()), Err)
    }

    fn submit_copies(&mut self, copies: &[(D::Structure, D::Structure)]) -> DeviceResult<D::Fence> {
        let mut commands = self.device.begin_commands()?;
        for &(src, dst) in copies {
            if let Err(err) = self.device.cmd_copy_compacted(&mut commands, src, dst) {
                self.device.discard_commands(commands);
                return Err(err);
            }
        }
        self.device.submit(commands)
    }

    fn skip(handle: &mut AccelerationStructureHandle<D>, reason: SkipReason) -> Result<()> {
        handle.state.advance(ItemState::Skipped)?;
        handle.outcome = Some(CompactionOutcome::Skipped(reason));
        Ok(())
    }

    /// Move every handle to `Final`. Eligible items that were never compacted
    /// are marked skipped with `eligible_reason`.
    fn finalize(
        handles: &mut [AccelerationStructureHandle<D>],
        eligible_reason: SkipReason,
    ) -> Result<()> {
        for handle in handles {
            if handle.state == ItemState::Built {
                let reason = if handle.is_empty() {
                    SkipReason::EmptyGeometry
                } else if handle.compaction.is_eligible() {
                    eligible_reason.clone()
                } else {
                    SkipReason::NotEligible
                };
                Self::skip(handle, reason)?;
            }
            handle.state.advance(ItemState::Final)?;
        }
        Ok(())
    }

    fn first_failure(execution: &BatchExecution<D>) -> Option<BuildError> {
        execution
            .sub_batches
            .iter()
            .enumerate()
            .find_map(|(index, sub_batch)| {
                sub_batch
                    .failure
                    .clone()
                    .map(|source| BuildError::BuildCommandFailed {
                        sub_batch: index,
                        source,
                    })
            })
    }

    /// Free the scratch buffer and size queries once every fence has signaled.
    fn release_completed(&mut self, sub_batches: Vec<SubBatch<D>>, scratch: Option<D::Buffer>) {
        for sub_batch in sub_batches {
            if let Some(query) = sub_batch.size_query {
                self.device.release_size_query(query);
            }
        }
        if let Some(buffer) = scratch {
            if let Err(err) = self.device.destroy_buffer(buffer) {
                warn!("Failed to release BLAS scratch buffer: {err}");
            }
        }
    }

    /// Free everything the batch owns once all of its submitted work is done.
    fn release_execution(&mut self, execution: BatchExecution<D>, mut retired: Retired<D>) {
        let BatchExecution {
            handles,
            sub_batches,
            scratch,
        } = execution;

        for sub_batch in sub_batches {
            retired.fences.extend(sub_batch.fence);
            retired.size_queries.extend(sub_batch.size_query);
        }
        for handle in handles {
            retired.push_handle(handle);
        }
        if let Some(buffer) = scratch {
            retired
                .buffers
                .push((format!("{} scratch", self.config.label_prefix), buffer));
        }

        if let Err(err) = self.release(retired) {
            warn!("Failed to release BLAS batch: {err}");
        }
    }

    /// Wait on every fence of `retired`; free its objects only if all signal.
    ///
    /// Otherwise the whole set is kept for [`Self::reclaim_retired`].
    fn release(&mut self, mut retired: Retired<D>) -> Result<()> {
        let timeout = self.config.fence_timeout_ns;
        retired.fences.retain(|fence| match fence.wait(timeout) {
            Ok(()) => false,
            Err(err) => {
                warn!("Work using released BLAS resources has not completed: {err}");
                true
            }
        });
        if !retired.fences.is_empty() {
            warn!(
                fences = retired.fences.len(),
                buffers = retired.buffers.len(),
                "Holding back BLAS resources until their work completes"
            );
            self.retired.push(retired);
            return Ok(());
        }

        let Retired {
            structures,
            buffers,
            size_queries,
            ..
        } = retired;
        for query in size_queries {
            self.device.release_size_query(query);
        }
        for structure in structures {
            self.device.destroy_structure(structure);
        }
        let mut first_error = None;
        for (label, buffer) in buffers {
            if let Err(source) = self.device.destroy_buffer(buffer) {
                first_error.get_or_insert(BuildError::Release { label, source });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn release_handles(&mut self, handles: Vec<AccelerationStructureHandle<D>>) {
        if let Err(err) = self.destroy_handles(handles) {
            warn!("Failed to release BLAS storage: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{BuildRange, GeometryDesc};
    use crate::sim::{DeviceEvent, SimulatedDevice, SizeModel};

    fn input(label: &str, primitives: u32, flags: BuildFlags) -> GeometryBuildInput {
        GeometryBuildInput::new(label, flags)
            .with_geometry(GeometryDesc::aabbs(0x1000, 24), BuildRange::new(primitives))
    }

    fn builder() -> BatchAccelerationBuilder<SimulatedDevice> {
        BatchAccelerationBuilder::new(SimulatedDevice::default(), BuilderConfig::default())
    }

    fn position(events: &[DeviceEvent], wanted: &DeviceEvent) -> usize {
        events
            .iter()
            .position(|e| e == wanted)
            .unwrap_or_else(|| panic!("missing event {wanted:?}"))
    }

    #[test]
    fn plan_aggregates_sizes() {
        let builder = builder();
        let inputs = vec![
            input("a", 10, BuildFlags::ALLOW_COMPACTION),
            input("b", 4, BuildFlags::empty()),
            input("c", 7, BuildFlags::ALLOW_COMPACTION),
        ];

        let plan = builder.plan_batch(&inputs, BuildFlags::DEFAULT_GLOBAL).unwrap();

        let structure_sum: u64 = plan.items.iter().map(|i| i.sizes.structure_size).sum();
        let scratch_max = plan
            .items
            .iter()
            .map(|i| i.sizes.build_scratch_size)
            .max()
            .unwrap();
        assert_eq!(plan.total_storage_size, structure_sum);
        assert_eq!(plan.total_storage_size, 2100);
        assert_eq!(plan.peak_scratch_size, scratch_max);
        assert_eq!(plan.peak_scratch_size, 100);
        assert_eq!(plan.compaction_candidates, 2);
        assert!(plan.items.iter().all(|i| i.flags.contains(BuildFlags::PREFER_FAST_TRACE)));
    }

    #[test]
    fn single_item_peak_is_its_scratch() {
        let builder = builder();
        let plan = builder
            .plan_batch(&[input("only", 3, BuildFlags::empty())], BuildFlags::empty())
            .unwrap();
        assert_eq!(plan.peak_scratch_size, 30);
        assert_eq!(plan.items[0].max_primitive_counts, vec![3]);
    }

    #[test]
    fn global_flags_grant_compaction() {
        let builder = builder();
        let inputs = vec![
            input("a", 1, BuildFlags::empty()),
            input("b", 1, BuildFlags::PREFER_FAST_BUILD),
        ];

        let plan = builder
            .plan_batch(&inputs, BuildFlags::ALLOW_COMPACTION)
            .unwrap();

        assert_eq!(plan.compaction_candidates, 2);
        assert!(plan.items.iter().all(|i| i.compaction == CompactionPolicy::Eligible));
        assert!(plan.items[1].flags.contains(BuildFlags::PREFER_FAST_BUILD));
    }

    #[test]
    fn empty_geometry_is_planned_not_skipped() {
        let builder = builder();
        let inputs = vec![
            input("a", 2, BuildFlags::empty()),
            GeometryBuildInput::new("empty", BuildFlags::ALLOW_COMPACTION),
            input("c", 1, BuildFlags::empty()),
        ];

        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.items[1].index, 1);
        assert_eq!(plan.items[1].sizes, BuildSizeRequirement::default());
        assert_eq!(plan.peak_scratch_size, 20);
        assert_eq!(plan.total_storage_size, 300);
        assert_eq!(plan.compaction_candidates, 1);
    }

    #[test]
    fn device_query_failure_is_fatal() {
        let builder = builder();
        builder.device().fail_size_query_at(1);
        let inputs = vec![
            input("a", 1, BuildFlags::empty()),
            input("b", 1, BuildFlags::empty()),
        ];

        let err = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap_err();
        assert!(matches!(
            err,
            BuildError::DeviceQueryFailed {
                item: 1,
                source: DeviceError::DeviceLost
            }
        ));
    }

    #[test]
    fn empty_batch_plans_to_nothing() {
        let mut builder = builder();
        let plan = builder.plan_batch(&[], BuildFlags::DEFAULT_GLOBAL).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.peak_scratch_size, 0);

        let execution = builder.execute_batch(&plan, &[], 0).unwrap();
        let handles = builder.compact(execution, &plan).unwrap();
        assert!(handles.is_empty());
        assert_eq!(builder.device().live_buffers(), 0);
    }

    #[test]
    fn execute_splits_by_scratch_budget() {
        let mut builder = builder();
        let inputs: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|label| input(label, 1, BuildFlags::empty()))
            .collect();
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();

        let execution = builder.execute_batch(&plan, &inputs, 25).unwrap();

        assert_eq!(execution.sub_batches(), vec![0..2, 2..3]);
        let sub_batches: Vec<_> = execution.handles().iter().map(|h| h.sub_batch()).collect();
        assert_eq!(sub_batches, vec![0, 0, 1]);
        assert_eq!(builder.device().submission_count(), 2);

        let scratch_sizes: Vec<_> = builder
            .device()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                DeviceEvent::BufferCreated {
                    size,
                    usage: BufferUsage::Scratch,
                    ..
                } => Some(size),
                _ => None,
            })
            .collect();
        assert_eq!(scratch_sizes, vec![20]);

        let handles = builder.finish(execution).unwrap();
        builder.destroy_handles(handles).unwrap();
        assert_eq!(builder.device().live_buffers(), 0);
    }

    #[test]
    fn handles_keep_input_order() {
        let mut builder = builder();
        let inputs: Vec<_> = ["A", "B", "C", "D"]
            .iter()
            .map(|label| input(label, 1, BuildFlags::ALLOW_COMPACTION))
            .collect();
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();

        let execution = builder.execute_batch(&plan, &inputs, 20).unwrap();
        assert_eq!(execution.sub_batches(), vec![0..2, 2..4]);

        let handles = builder.compact(execution, &plan).unwrap();
        let labels: Vec<_> = handles.iter().map(|h| h.label().to_string()).collect();
        assert_eq!(labels, vec!["blas[0] A", "blas[1] B", "blas[2] C", "blas[3] D"]);
        let indices: Vec<_> = handles.iter().map(|h| h.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn oversized_item_fails_before_allocating() {
        let mut builder = builder();
        let inputs = vec![
            input("small", 1, BuildFlags::empty()),
            input("huge", 3, BuildFlags::empty()),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();

        let err = builder.execute_batch(&plan, &inputs, 25).err().unwrap();

        assert!(matches!(
            err,
            BuildError::UnsatisfiableScratchBudget {
                item: 1,
                required: 30,
                budget: 25
            }
        ));
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().submission_count(), 0);
    }

    #[test]
    fn plan_must_match_inputs() {
        let mut builder = builder();
        let inputs = vec![input("a", 1, BuildFlags::empty())];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();

        let err = builder.execute_batch(&plan, &[], 100).err().unwrap();
        assert!(matches!(err, BuildError::InvalidInput(_)));
    }

    #[test]
    fn compaction_replaces_storage_after_fence() {
        let mut builder = builder();
        let inputs = vec![input("mesh", 10, BuildFlags::ALLOW_COMPACTION)];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        assert_eq!(plan.items[0].sizes.structure_size, 1000);

        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();
        let original_buffer = execution.handles()[0].buffer().unwrap().id;
        let original_structure = execution.handles()[0].structure().unwrap();

        let handles = builder.compact(execution, &plan).unwrap();
        let handle = &handles[0];

        assert_eq!(handle.storage_size(), 400);
        assert_eq!(handle.buffer().unwrap().size, 400);
        assert_ne!(handle.structure(), Some(original_structure));
        assert_eq!(handle.state(), ItemState::Final);
        assert_eq!(
            handle.outcome(),
            Some(&CompactionOutcome::Compacted { from: 1000, to: 400 })
        );

        let events = builder.device().events();
        let destroyed = DeviceEvent::BufferDestroyed {
            id: original_buffer,
        };
        let destroyed_count = events.iter().filter(|e| **e == destroyed).count();
        assert_eq!(destroyed_count, 1);
        assert!(
            position(&events, &DeviceEvent::FenceWaited { submission: 0 })
                < position(&events, &destroyed)
        );

        // Only the compacted storage is left; scratch and the original are gone.
        assert_eq!(builder.device().live_buffers(), 1);
        builder.destroy_handles(handles).unwrap();
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn non_eligible_items_are_untouched() {
        let mut builder = builder();
        let inputs = vec![
            input("plain", 10, BuildFlags::empty()),
            input("compact", 10, BuildFlags::ALLOW_COMPACTION),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();

        let before_structure = execution.handles()[0].structure();
        let before_buffer = execution.handles()[0].buffer().unwrap().id;

        let handles = builder.compact(execution, &plan).unwrap();

        assert_eq!(handles[0].structure(), before_structure);
        assert_eq!(handles[0].buffer().unwrap().id, before_buffer);
        assert_eq!(handles[0].storage_size(), 1000);
        assert_eq!(
            handles[0].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::NotEligible))
        );
        assert_eq!(handles[1].storage_size(), 400);

        let summary = CompactionSummary::from_handles(&handles);
        assert_eq!(summary.original_bytes, 2000);
        assert_eq!(summary.final_bytes, 1400);
        assert_eq!(summary.saved_bytes(), 600);
    }

    #[test]
    fn failed_size_query_keeps_original() {
        let mut builder = builder();
        let inputs = vec![
            input("broken", 10, BuildFlags::ALLOW_COMPACTION),
            input("fine", 10, BuildFlags::ALLOW_COMPACTION),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();
        let broken = execution.handles()[0].structure().unwrap();
        builder.device().fail_compacted_size_for(broken);

        let handles = builder.compact(execution, &plan).unwrap();

        assert_eq!(handles[0].structure(), Some(broken));
        assert_eq!(handles[0].storage_size(), 1000);
        assert_eq!(
            handles[0].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::QueryFailed(
                DeviceError::DeviceLost
            )))
        );
        assert_eq!(handles[1].storage_size(), 400);
        assert!(handles.iter().all(|h| h.state() == ItemState::Final));
    }

    #[test]
    fn compaction_waits_only_for_its_own_sub_batch() {
        let mut builder = builder();
        let inputs = vec![
            input("a", 1, BuildFlags::ALLOW_COMPACTION),
            input("b", 1, BuildFlags::ALLOW_COMPACTION),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 10).unwrap();
        assert_eq!(execution.sub_batches(), vec![0..1, 1..2]);
        assert!(!execution.is_complete().unwrap());

        builder.compact(execution, &plan).unwrap();

        let events = builder.device().events();
        let first_copy = events
            .iter()
            .position(|e| matches!(e, DeviceEvent::Submitted { submission: 2, copies, .. } if copies.len() == 1))
            .unwrap();
        assert!(position(&events, &DeviceEvent::FenceWaited { submission: 0 }) < first_copy);
        assert!(first_copy < position(&events, &DeviceEvent::FenceWaited { submission: 1 }));
    }

    #[test]
    fn failed_sub_batch_releases_the_batch() {
        let mut builder = builder();
        builder.device().fail_submit_at(1);
        let inputs = vec![
            input("a", 1, BuildFlags::ALLOW_COMPACTION),
            input("b", 1, BuildFlags::ALLOW_COMPACTION),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 10).unwrap();
        assert_eq!(execution.failed_sub_batches(), vec![1]);

        let err = builder.compact(execution, &plan).unwrap_err();

        assert!(matches!(
            err,
            BuildError::BuildCommandFailed { sub_batch: 1, .. }
        ));
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn timed_out_build_is_waited_before_release() {
        let mut builder = BatchAccelerationBuilder::new(
            SimulatedDevice::default(),
            BuilderConfig::default().with_fence_timeout(1_000),
        );
        builder.device().fail_wait_at(0);
        let inputs = vec![input("mesh", 10, BuildFlags::ALLOW_COMPACTION)];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();

        let err = builder.compact(execution, &plan).unwrap_err();

        assert!(matches!(
            err,
            BuildError::BuildCommandFailed {
                sub_batch: 0,
                source: DeviceError::Timeout
            }
        ));
        let events = builder.device().events();
        let waited = position(&events, &DeviceEvent::FenceWaited { submission: 0 });
        let first_destroy = events
            .iter()
            .position(|e| matches!(e, DeviceEvent::BufferDestroyed { .. }))
            .unwrap();
        assert!(waited < first_destroy);
        assert_eq!(builder.retired_count(), 0);
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn hung_build_holds_memory_until_reclaimed() {
        let mut builder = builder();
        builder.device().hang_submission(0);
        let inputs = vec![input("mesh", 10, BuildFlags::ALLOW_COMPACTION)];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();

        let err = builder.compact(execution, &plan).unwrap_err();

        assert!(matches!(err, BuildError::BuildCommandFailed { sub_batch: 0, .. }));
        assert_eq!(builder.retired_count(), 1);
        // Storage and scratch stay alive while the build may still run.
        assert_eq!(builder.device().live_buffers(), 2);
        assert!(!builder
            .device()
            .events()
            .iter()
            .any(|e| matches!(e, DeviceEvent::BufferDestroyed { .. })));

        builder.reclaim_retired().unwrap();
        assert_eq!(builder.retired_count(), 1);

        builder.device().resume_submission(0);
        builder.reclaim_retired().unwrap();
        assert_eq!(builder.retired_count(), 0);
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn hung_copy_keeps_source_and_target() {
        let mut builder = builder();
        builder.device().hang_submission(1);
        let inputs = vec![input("mesh", 10, BuildFlags::ALLOW_COMPACTION)];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();

        let err = builder.compact(execution, &plan).unwrap_err();

        assert!(matches!(
            err,
            BuildError::BuildCommandFailed {
                sub_batch: 0,
                source: DeviceError::Timeout
            }
        ));
        // Original, compacted target and scratch.
        assert_eq!(builder.device().live_buffers(), 3);
        assert_eq!(builder.device().live_structures(), 2);
        assert_eq!(builder.retired_count(), 1);

        builder.device().resume_submission(1);
        builder.reclaim_retired().unwrap();
        assert_eq!(builder.retired_count(), 0);
        assert_eq!(builder.device().live_buffers(), 0);
        assert_eq!(builder.device().live_structures(), 0);
    }

    #[test]
    fn failed_copy_submit_keeps_original() {
        let mut builder = builder();
        let inputs = vec![input("mesh", 10, BuildFlags::ALLOW_COMPACTION)];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();
        let original = execution.handles()[0].structure();
        builder.device().fail_submit_at(1);

        let handles = builder.compact(execution, &plan).unwrap();

        assert_eq!(handles[0].structure(), original);
        assert_eq!(handles[0].storage_size(), 1000);
        assert_eq!(handles[0].state(), ItemState::Final);
        assert_eq!(
            handles[0].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::CopyFailed(
                DeviceError::OutOfDeviceMemory
            )))
        );
        // The unused compacted buffer and the scratch are gone.
        assert_eq!(builder.device().live_buffers(), 1);
        assert_eq!(builder.device().live_structures(), 1);
    }

    #[test]
    fn compaction_without_savings_is_skipped() {
        let mut builder = BatchAccelerationBuilder::new(
            SimulatedDevice::new(SizeModel {
                compaction_percent: 100,
                ..SizeModel::default()
            }),
            BuilderConfig::default(),
        );
        let inputs = vec![input("dense", 10, BuildFlags::ALLOW_COMPACTION)];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();

        let handles = builder.compact(execution, &plan).unwrap();

        assert_eq!(handles[0].storage_size(), 1000);
        assert_eq!(
            handles[0].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::NoSavings {
                compacted_size: 1000
            }))
        );
        assert_eq!(builder.device().submission_count(), 1);
    }

    #[test]
    fn failed_release_still_swaps_every_item() {
        let mut builder = builder();
        let inputs = vec![
            input("a", 10, BuildFlags::ALLOW_COMPACTION),
            input("b", 10, BuildFlags::ALLOW_COMPACTION),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();
        let stuck = execution.handles()[0].buffer().unwrap().id;
        builder.device().fail_destroy_of(stuck);

        let err = builder.compact(execution, &plan).unwrap_err();

        assert!(matches!(
            err,
            BuildError::Release { ref label, .. } if label == "blas[0] a"
        ));
        // Only the buffer whose destroy failed is left.
        assert_eq!(builder.device().live_buffers(), 1);
        assert_eq!(builder.device().live_structures(), 0);
        assert_eq!(builder.retired_count(), 0);
    }

    #[test]
    fn discarding_failed_sub_batch_keeps_the_rest() {
        let mut builder = builder();
        builder.device().fail_submit_at(1);
        let inputs = vec![
            input("a", 1, BuildFlags::ALLOW_COMPACTION),
            input("b", 1, BuildFlags::ALLOW_COMPACTION),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let mut execution = builder.execute_batch(&plan, &inputs, 10).unwrap();

        let failures = builder.discard_failed(&mut execution).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0],
            BuildError::BuildCommandFailed {
                sub_batch: 1,
                source: DeviceError::OutOfDeviceMemory
            }
        ));
        assert!(execution.failed_sub_batches().is_empty());

        let handles = builder.compact(execution, &plan).unwrap();

        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].storage_size(), 40);
        assert!(handles[1].is_empty());
        assert_eq!(handles[1].state(), ItemState::Final);
        assert_eq!(
            handles[1].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::BuildFailed(
                DeviceError::OutOfDeviceMemory
            )))
        );
        assert_eq!(builder.device().live_buffers(), 1);
    }

    #[test]
    fn scratch_padding_counts_against_budget() {
        let mut builder = BatchAccelerationBuilder::new(
            SimulatedDevice::new(SizeModel {
                scratch_padding: 8,
                ..SizeModel::default()
            }),
            BuilderConfig::default(),
        );
        let inputs: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|label| input(label, 1, BuildFlags::empty()))
            .collect();
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();

        let execution = builder.execute_batch(&plan, &inputs, 30).unwrap();

        assert_eq!(execution.sub_batches(), vec![0..2, 2..3]);
        let scratch_size = builder
            .device()
            .events()
            .into_iter()
            .find_map(|e| match e {
                DeviceEvent::BufferCreated {
                    size,
                    usage: BufferUsage::Scratch,
                    ..
                } => Some(size),
                _ => None,
            })
            .unwrap();
        assert_eq!(scratch_size, 28);
        assert!(scratch_size <= 30);
        builder.finish(execution).unwrap();
    }

    #[test]
    fn finish_skips_compaction() {
        let mut builder = builder();
        let inputs = vec![
            input("a", 10, BuildFlags::ALLOW_COMPACTION),
            GeometryBuildInput::new("empty", BuildFlags::empty()),
        ];
        let plan = builder.plan_batch(&inputs, BuildFlags::empty()).unwrap();
        let execution = builder.execute_batch(&plan, &inputs, 1 << 20).unwrap();

        let handles = builder.finish(execution).unwrap();

        assert_eq!(handles[0].storage_size(), 1000);
        assert_eq!(
            handles[0].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::CompactionNotRun))
        );
        assert!(handles[1].is_empty());
        assert_eq!(
            handles[1].outcome(),
            Some(&CompactionOutcome::Skipped(SkipReason::EmptyGeometry))
        );
        // Scratch is released, the one storage buffer remains.
        assert_eq!(builder.device().live_buffers(), 1);
    }
}
