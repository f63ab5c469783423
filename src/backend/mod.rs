//! Device primitives the simulation core is written against.
//!
//! Work is recorded into a single ordered command stream and only executes on
//! `submit`. `discard` drops everything recorded since the last submit.

pub mod gpu;
pub mod host;

use std::collections::HashMap;

use crate::error::{ReadbackError, SetupError, TickError};
use crate::grid::{GridDims, SampleKind, WorkgroupCount};
use crate::params::SimulationConstants;
use crate::stage::{StageBindings, StageKind};

pub use gpu::WgpuBackend;
pub use host::HostBackend;

/// Non-owning handle to a field buffer held by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Declared intent for the next use of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    ShaderRead,
    ShaderWrite,
    CopySrc,
    CopyDst,
}

/// Outcome of a non-blocking readback poll.
#[derive(Debug, PartialEq)]
pub enum ReadbackPoll {
    Pending,
    Ready(Vec<f32>),
}

pub trait ComputeBackend {
    fn create_field(
        &mut self,
        label: &str,
        dims: GridDims,
        kind: SampleKind,
        initial: Option<&[f32]>,
    ) -> Result<BufferId, SetupError>;

    /// Compiles the program for `stage`; `dims` feeds its grid-only uniform.
    fn create_program(&mut self, stage: StageKind, dims: GridDims) -> Result<(), SetupError>;

    fn has_program(&self, stage: StageKind) -> bool;

    /// Replaces the stage's uniform contents (discard-on-write).
    fn write_constants(&mut self, stage: StageKind, constants: &SimulationConstants) -> Result<(), TickError>;

    fn transition(&mut self, buffer: BufferId, state: ResourceState);

    fn dispatch(&mut self, bindings: &StageBindings, groups: WorkgroupCount) -> Result<(), TickError>;

    fn clear_field(&mut self, buffer: BufferId) -> Result<(), TickError>;

    /// Writes vec4 samples into runs of cells via a host-visible staging copy.
    /// `rows` are (first cell index, cell count).
    fn upload_cells(&mut self, target: BufferId, rows: &[(usize, usize)], value: [f32; 4]) -> Result<(), TickError>;

    fn submit(&mut self);

    fn discard(&mut self);

    /// Copies `source` into staging and starts mapping it.
    fn begin_readback(&mut self, source: BufferId) -> Result<(), ReadbackError>;

    /// `wait` blocks until the mapping completes.
    fn poll_readback(&mut self, wait: bool) -> Result<ReadbackPoll, ReadbackError>;
}

/// Last declared state per buffer.
#[derive(Debug, Default, Clone)]
pub struct ResourceStates {
    states: HashMap<BufferId, ResourceState>,
}

impl ResourceStates {
    pub fn set(&mut self, buffer: BufferId, state: ResourceState) -> Option<ResourceState> {
        self.states.insert(buffer, state)
    }

    pub fn get(&self, buffer: BufferId) -> Option<ResourceState> {
        self.states.get(&buffer).copied()
    }

    /// Checks every bound resource against the state its access requires.
    pub fn check(&self, bindings: &StageBindings) -> Result<(), TickError> {
        for (buffer, access) in bindings.resources() {
            let expected = access.required_state();
            let found = self.get(buffer);
            if found != Some(expected) {
                return Err(TickError::ResourceState { stage: bindings.stage(), buffer, expected, found });
            }
        }
        Ok(())
    }
}
