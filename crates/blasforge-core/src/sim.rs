//! Deterministic in-memory device.
//!
//! Sizes come from a linear [`SizeModel`] and submitted work completes only
//! when its fence is waited on (or [`SimulatedDevice::complete_pending`] is
//! called). Every call is recorded as a [`DeviceEvent`], and the device
//! rejects the hazards a real driver would not catch for you: reading a
//! query before its submission finished, and destroying a buffer that
//! pending work still references.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{AccelerationDevice, BufferUsage, CompletionToken, StructureBuild};
use crate::error::{DeviceError, DeviceResult};
use crate::flags::BuildFlags;
use crate::input::GeometryDesc;
use crate::plan::BuildSizeRequirement;

/// Linear size model used by [`SimulatedDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeModel {
    pub structure_bytes_per_primitive: u64,
    pub scratch_bytes_per_primitive: u64,
    pub update_scratch_bytes_per_primitive: u64,
    /// Compacted size as a percentage of the built size.
    pub compaction_percent: u64,
    /// Extra bytes added to every scratch allocation.
    pub scratch_padding: u64,
}

impl Default for SizeModel {
    fn default() -> Self {
        Self {
            structure_bytes_per_primitive: 100,
            scratch_bytes_per_primitive: 10,
            update_scratch_bytes_per_primitive: 5,
            compaction_percent: 40,
            scratch_padding: 0,
        }
    }
}

/// A buffer owned by the simulated device.
#[derive(Debug, PartialEq, Eq)]
pub struct SimBuffer {
    pub id: u64,
    pub size: u64,
}

/// A simulated acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimStructure(pub u64);

/// Commands being recorded.
#[derive(Debug, Default)]
pub struct SimCommands {
    builds: Vec<SimStructure>,
    copies: Vec<(SimStructure, SimStructure)>,
    queries: Vec<u64>,
    buffers: Vec<u64>,
}

/// Handle to recorded compacted-size queries.
#[derive(Debug)]
pub struct SimSizeQuery {
    id: u64,
}

/// Something the builder asked the device to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    BufferCreated { id: u64, size: u64, usage: BufferUsage },
    BufferDestroyed { id: u64 },
    StructureCreated { structure: SimStructure, buffer: u64 },
    StructureDestroyed { structure: SimStructure },
    Submitted {
        submission: usize,
        builds: Vec<SimStructure>,
        copies: Vec<(SimStructure, SimStructure)>,
    },
    FenceWaited { submission: usize },
}

#[derive(Debug)]
struct Submission {
    completed: bool,
    buffers: Vec<u64>,
}

#[derive(Debug)]
struct QueryRecord {
    submission: Option<usize>,
    structures: Vec<SimStructure>,
}

#[derive(Debug, Default)]
struct Faults {
    size_query_at: Option<usize>,
    submit_at: Option<usize>,
    wait_at: Option<usize>,
    hung: HashSet<usize>,
    destroy_of: HashSet<u64>,
    compacted_size_for: HashSet<SimStructure>,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    size_queries: usize,
    waits: usize,
    buffers: HashMap<u64, u64>,
    structures: HashMap<SimStructure, u64>,
    compacted_sizes: HashMap<SimStructure, u64>,
    submissions: Vec<Submission>,
    queries: HashMap<u64, QueryRecord>,
    events: Vec<DeviceEvent>,
    faults: Faults,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer_in_use(&self, id: u64) -> bool {
        self.submissions
            .iter()
            .any(|s| !s.completed && s.buffers.contains(&id))
    }
}

/// Simulated [`AccelerationDevice`].
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    model: SizeModel,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new(model: SizeModel) -> Self {
        Self {
            model,
            state: Arc::default(),
        }
    }

    pub fn model(&self) -> SizeModel {
        self.model
    }

    /// Make the `n`th size query (0-based) report a lost device.
    pub fn fail_size_query_at(&self, n: usize) {
        self.state.lock().faults.size_query_at = Some(n);
    }

    /// Make the `n`th submission (0-based) fail.
    pub fn fail_submit_at(&self, n: usize) {
        self.state.lock().faults.submit_at = Some(n);
    }

    /// Make the `n`th fence wait (0-based) time out once.
    pub fn fail_wait_at(&self, n: usize) {
        self.state.lock().faults.wait_at = Some(n);
    }

    /// Keep `submission` running: its fence waits time out until resumed.
    pub fn hang_submission(&self, submission: usize) {
        self.state.lock().faults.hung.insert(submission);
    }

    pub fn resume_submission(&self, submission: usize) {
        self.state.lock().faults.hung.remove(&submission);
    }

    /// Make the next destroy of buffer `id` fail, leaving it alive.
    pub fn fail_destroy_of(&self, id: u64) {
        self.state.lock().faults.destroy_of.insert(id);
    }

    /// Make compacted-size reads for `structure` fail.
    pub fn fail_compacted_size_for(&self, structure: SimStructure) {
        self.state.lock().faults.compacted_size_for.insert(structure);
    }

    /// Mark all submitted work as finished.
    pub fn complete_pending(&self) {
        for submission in &mut self.state.lock().submissions {
            submission.completed = true;
        }
    }

    /// Every call recorded so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state.lock().events.clone()
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Structures created and not yet destroyed.
    pub fn live_structures(&self) -> usize {
        self.state.lock().structures.len()
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    fn total_primitives(counts: &[u32]) -> u64 {
        counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Fence for a simulated submission.
#[derive(Debug)]
pub struct SimFence {
    state: Arc<Mutex<SimState>>,
    submission: usize,
}

impl SimFence {
    pub fn submission(&self) -> usize {
        self.submission
    }
}

impl CompletionToken for SimFence {
    fn wait(&self, _timeout_ns: u64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let call = state.waits;
        state.waits += 1;
        if state.faults.wait_at == Some(call) {
            state.faults.wait_at = None;
            return Err(DeviceError::Timeout);
        }
        if state.faults.hung.contains(&self.submission) {
            return Err(DeviceError::Timeout);
        }

        state.submissions[self.submission].completed = true;
        state.events.push(DeviceEvent::FenceWaited {
            submission: self.submission,
        });
        Ok(())
    }

    fn poll(&self) -> DeviceResult<bool> {
        let state = self.state.lock();
        Ok(!state.faults.hung.contains(&self.submission)
            && state.submissions[self.submission].completed)
    }
}

impl AccelerationDevice for SimulatedDevice {
    type Buffer = SimBuffer;
    type Structure = SimStructure;
    type Commands = SimCommands;
    type Fence = SimFence;
    type SizeQuery = SimSizeQuery;

    fn query_build_sizes(
        &self,
        _geometries: &[GeometryDesc],
        max_primitive_counts: &[u32],
        _flags: BuildFlags,
    ) -> DeviceResult<BuildSizeRequirement> {
        let mut state = self.state.lock();
        let call = state.size_queries;
        state.size_queries += 1;
        if state.faults.size_query_at == Some(call) {
            return Err(DeviceError::DeviceLost);
        }

        let primitives = Self::total_primitives(max_primitive_counts);
        Ok(BuildSizeRequirement {
            structure_size: primitives * self.model.structure_bytes_per_primitive,
            build_scratch_size: primitives * self.model.scratch_bytes_per_primitive,
            update_scratch_size: primitives * self.model.update_scratch_bytes_per_primitive,
        })
    }

    fn create_buffer(
        &mut self,
        size: u64,
        usage: BufferUsage,
        _label: &str,
    ) -> DeviceResult<SimBuffer> {
        if size == 0 {
            return Err(DeviceError::Other("zero-sized buffer".to_string()));
        }
        let size = match usage {
            BufferUsage::Scratch => size + self.model.scratch_padding,
            BufferUsage::AccelerationStorage => size,
        };
        let mut state = self.state.lock();
        let id = state.next_id();
        state.buffers.insert(id, size);
        state.events.push(DeviceEvent::BufferCreated { id, size, usage });
        Ok(SimBuffer { id, size })
    }

    fn destroy_buffer(&mut self, buffer: SimBuffer) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if state.faults.destroy_of.remove(&buffer.id) {
            return Err(DeviceError::OutOfHostMemory);
        }
        if state.buffer_in_use(buffer.id) {
            return Err(DeviceError::Other(format!(
                "buffer {} destroyed while in use",
                buffer.id
            )));
        }
        if state.buffers.remove(&buffer.id).is_none() {
            return Err(DeviceError::Other(format!(
                "buffer {} destroyed twice",
                buffer.id
            )));
        }
        state
            .events
            .push(DeviceEvent::BufferDestroyed { id: buffer.id });
        Ok(())
    }

    fn create_structure(&mut self, buffer: &SimBuffer, size: u64) -> DeviceResult<SimStructure> {
        if size > buffer.size {
            return Err(DeviceError::Other(format!(
                "structure of {size} bytes does not fit buffer of {} bytes",
                buffer.size
            )));
        }
        let mut state = self.state.lock();
        let structure = SimStructure(state.next_id());
        state.structures.insert(structure, buffer.id);
        state.events.push(DeviceEvent::StructureCreated {
            structure,
            buffer: buffer.id,
        });
        Ok(structure)
    }

    fn destroy_structure(&mut self, structure: SimStructure) {
        let mut state = self.state.lock();
        state.structures.remove(&structure);
        state.compacted_sizes.remove(&structure);
        state
            .events
            .push(DeviceEvent::StructureDestroyed { structure });
    }

    fn begin_commands(&mut self) -> DeviceResult<SimCommands> {
        Ok(SimCommands::default())
    }

    fn discard_commands(&mut self, _commands: SimCommands) {}

    fn cmd_build_structures(
        &mut self,
        commands: &mut SimCommands,
        builds: &[StructureBuild<'_, Self>],
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        for build in builds {
            let buffer = *state
                .structures
                .get(&build.destination)
                .ok_or_else(|| DeviceError::Other("unknown structure".to_string()))?;

            let built = build.input.total_primitives() * self.model.structure_bytes_per_primitive;
            let compacted = built * self.model.compaction_percent / 100;
            state.compacted_sizes.insert(build.destination, compacted);

            commands.builds.push(build.destination);
            commands.buffers.push(buffer);
            if let Some(scratch) = build.scratch {
                commands.buffers.push(scratch.id);
            }
        }
        Ok(())
    }

    fn cmd_query_compacted_sizes(
        &mut self,
        commands: &mut SimCommands,
        structures: &[SimStructure],
    ) -> DeviceResult<SimSizeQuery> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.queries.insert(
            id,
            QueryRecord {
                submission: None,
                structures: structures.to_vec(),
            },
        );
        commands.queries.push(id);
        Ok(SimSizeQuery { id })
    }

    fn cmd_copy_compacted(
        &mut self,
        commands: &mut SimCommands,
        src: SimStructure,
        dst: SimStructure,
    ) -> DeviceResult<()> {
        let state = self.state.lock();
        for structure in [src, dst] {
            let buffer = *state
                .structures
                .get(&structure)
                .ok_or_else(|| DeviceError::Other("unknown structure".to_string()))?;
            commands.buffers.push(buffer);
        }
        commands.copies.push((src, dst));
        Ok(())
    }

    fn submit(&mut self, commands: SimCommands) -> DeviceResult<SimFence> {
        let mut state = self.state.lock();
        let submission = state.submissions.len();
        if state.faults.submit_at == Some(submission) {
            state.faults.submit_at = None;
            return Err(DeviceError::OutOfDeviceMemory);
        }

        state.submissions.push(Submission {
            completed: false,
            buffers: commands.buffers,
        });
        for query in &commands.queries {
            if let Some(record) = state.queries.get_mut(query) {
                record.submission = Some(submission);
            }
        }
        state.events.push(DeviceEvent::Submitted {
            submission,
            builds: commands.builds,
            copies: commands.copies,
        });

        Ok(SimFence {
            state: Arc::clone(&self.state),
            submission,
        })
    }

    fn read_compacted_size(&mut self, query: &SimSizeQuery, slot: usize) -> DeviceResult<u64> {
        let state = self.state.lock();
        let record = state
            .queries
            .get(&query.id)
            .ok_or_else(|| DeviceError::Other("unknown query".to_string()))?;

        let submission = record.submission.ok_or(DeviceError::NotReady)?;
        if !state.submissions[submission].completed {
            return Err(DeviceError::NotReady);
        }

        let structure = *record
            .structures
            .get(slot)
            .ok_or_else(|| DeviceError::Other(format!("query slot {slot} out of range")))?;
        if state.faults.compacted_size_for.contains(&structure) {
            return Err(DeviceError::DeviceLost);
        }

        state
            .compacted_sizes
            .get(&structure)
            .copied()
            .ok_or(DeviceError::NotReady)
    }

    fn release_size_query(&mut self, query: SimSizeQuery) {
        self.state.lock().queries.remove(&query.id);
    }

    fn scratch_padding(&self) -> u64 {
        self.model.scratch_padding
    }
}
