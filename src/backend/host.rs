//! CPU execution of the stage programs with the same record/submit semantics as the device.

use std::collections::{HashMap, HashSet};

use super::{BufferId, ComputeBackend, ReadbackPoll, ResourceState, ResourceStates};
use crate::error::{ReadbackError, SetupError, TickError};
use crate::grid::{GridDims, SampleKind, WorkgroupCount};
use crate::kernels::{self, Vec4};
use crate::params::{SimulationConstants, StageUniform};
use crate::stage::{StageBindings, StageKind};

struct HostBuffer {
    dims: GridDims,
    kind: SampleKind,
    data: Vec<f32>,
}

enum HostCommand {
    Dispatch(StageBindings),
    Clear(BufferId),
    Upload { target: BufferId, rows: Vec<(usize, usize)>, value: Vec4 },
}

struct PendingReadback {
    data: Vec<f32>,
    polls_left: u32,
}

#[derive(Default)]
pub struct HostBackend {
    buffers: Vec<HostBuffer>,
    programs: HashSet<StageKind>,
    broken_programs: HashSet<StageKind>,
    lost_on_dispatch: HashSet<StageKind>,
    uniforms: HashMap<StageKind, StageUniform>,
    states: ResourceStates,
    recorded: Vec<HostCommand>,
    executed: Vec<StageKind>,
    capture: HashSet<StageKind>,
    captures: HashMap<StageKind, Vec<f32>>,
    readback_latency: u32,
    pending_readback: Option<PendingReadback>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program creation for `stage` will fail, as if its shader did not compile.
    pub fn with_broken_program(mut self, stage: StageKind) -> Self {
        self.broken_programs.insert(stage);
        self
    }

    /// Non-blocking polls report `Pending` this many times before the data is ready.
    pub fn with_readback_latency(mut self, polls: u32) -> Self {
        self.readback_latency = polls;
        self
    }

    /// Keeps a copy of the buffer written by the last execution of `stage`.
    pub fn capture_after(&mut self, stage: StageKind) {
        self.capture.insert(stage);
    }

    pub fn captured(&self, stage: StageKind) -> Option<&[f32]> {
        self.captures.get(&stage).map(Vec::as_slice)
    }

    /// The program for `stage` disappears when its next dispatch is recorded.
    pub fn lose_program_on_dispatch(&mut self, stage: StageKind) {
        self.lost_on_dispatch.insert(stage);
    }

    /// Drops a compiled program, leaving the stage unavailable.
    pub fn evict_program(&mut self, stage: StageKind) {
        self.programs.remove(&stage);
    }

    /// Stages executed by submitted work, in order.
    pub fn executed(&self) -> &[StageKind] {
        &self.executed
    }

    pub fn buffer_data(&self, id: BufferId) -> Option<&[f32]> {
        self.buffers.get(id.0 as usize).map(|b| b.data.as_slice())
    }

    pub fn state_of(&self, id: BufferId) -> Option<ResourceState> {
        self.states.get(id)
    }

    pub fn pending_commands(&self) -> usize {
        self.recorded.len()
    }

    fn buffer(&self, id: BufferId) -> Result<&HostBuffer, TickError> {
        self.buffers.get(id.0 as usize).ok_or(TickError::UnknownBuffer(id))
    }

    fn take(&mut self, id: BufferId) -> Vec<f32> {
        std::mem::take(&mut self.buffers[id.0 as usize].data)
    }

    fn put(&mut self, id: BufferId, data: Vec<f32>) {
        self.buffers[id.0 as usize].data = data;
    }

    fn data(&self, id: BufferId) -> &[f32] {
        &self.buffers[id.0 as usize].data
    }

    fn constants(&self, stage: StageKind) -> SimulationConstants {
        self.uniforms.get(&stage).map(StageUniform::constants).unwrap_or_default()
    }

    fn execute(&mut self, command: HostCommand) {
        match command {
            HostCommand::Dispatch(bindings) => self.execute_dispatch(&bindings),
            HostCommand::Clear(id) => self.buffers[id.0 as usize].data.iter_mut().for_each(|x| *x = 0.0),
            HostCommand::Upload { target, rows, value } => {
                let data: &mut [Vec4] = bytemuck::cast_slice_mut(&mut self.buffers[target.0 as usize].data);
                for (start, len) in rows {
                    data[start..start + len].iter_mut().for_each(|v| *v = value);
                }
            }
        }
    }

    fn execute_dispatch(&mut self, bindings: &StageBindings) {
        let stage = bindings.stage();
        let written = match *bindings {
            StageBindings::Advect { velocity_in, velocity_out } => {
                let dims = self.buffers[velocity_out.0 as usize].dims;
                let constants = self.constants(stage);
                let mut out = self.take(velocity_out);
                kernels::advect(
                    dims,
                    bytemuck::cast_slice(self.data(velocity_in)),
                    bytemuck::cast_slice_mut(&mut out),
                    &constants,
                );
                self.put(velocity_out, out);
                velocity_out
            }
            StageBindings::ApplyForces { velocity } => {
                let constants = self.constants(stage);
                let data = &mut self.buffers[velocity.0 as usize].data;
                kernels::apply_forces(bytemuck::cast_slice_mut(data), &constants);
                velocity
            }
            StageBindings::Divergence { velocity, divergence } => {
                let dims = self.buffers[divergence.0 as usize].dims;
                let mut out = self.take(divergence);
                kernels::divergence(dims, bytemuck::cast_slice(self.data(velocity)), &mut out);
                self.put(divergence, out);
                divergence
            }
            StageBindings::Jacobi { pressure_in, divergence, pressure_out } => {
                let dims = self.buffers[pressure_out.0 as usize].dims;
                let mut out = self.take(pressure_out);
                kernels::jacobi(dims, self.data(pressure_in), self.data(divergence), &mut out);
                self.put(pressure_out, out);
                pressure_out
            }
            StageBindings::Project { pressure, velocity } => {
                let dims = self.buffers[velocity.0 as usize].dims;
                let mut out = self.take(velocity);
                kernels::project(dims, self.data(pressure), bytemuck::cast_slice_mut(&mut out));
                self.put(velocity, out);
                velocity
            }
        };
        self.executed.push(stage);
        if self.capture.contains(&stage) {
            let snapshot = self.data(written).to_vec();
            self.captures.insert(stage, snapshot);
        }
    }
}

impl ComputeBackend for HostBackend {
    fn create_field(
        &mut self,
        label: &str,
        dims: GridDims,
        kind: SampleKind,
        initial: Option<&[f32]>,
    ) -> Result<BufferId, SetupError> {
        if dims.is_empty() {
            return Err(SetupError::InvalidGrid(dims));
        }
        let len = dims.cell_count() * kind.lanes();
        let data = match initial {
            Some(values) if values.len() != len => {
                return Err(SetupError::InitialDataSize {
                    label: label.to_string(),
                    expected: len,
                    actual: values.len(),
                })
            }
            Some(values) => values.to_vec(),
            None => vec![0.0; len],
        };
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(HostBuffer { dims, kind, data });
        Ok(id)
    }

    fn create_program(&mut self, stage: StageKind, dims: GridDims) -> Result<(), SetupError> {
        if self.broken_programs.contains(&stage) {
            return Err(SetupError::ShaderCompilation {
                stage,
                message: "program marked unavailable".to_string(),
            });
        }
        self.uniforms.insert(stage, StageUniform::grid_only(dims));
        self.programs.insert(stage);
        Ok(())
    }

    fn has_program(&self, stage: StageKind) -> bool {
        self.programs.contains(&stage)
    }

    fn write_constants(&mut self, stage: StageKind, constants: &SimulationConstants) -> Result<(), TickError> {
        let uniform = self.uniforms.get_mut(&stage).ok_or(TickError::ProgramUnavailable(stage))?;
        let dims = GridDims::new(uniform.dims[0], uniform.dims[1], uniform.dims[2]);
        *uniform = StageUniform::new(dims, constants);
        Ok(())
    }

    fn transition(&mut self, buffer: BufferId, state: ResourceState) {
        self.states.set(buffer, state);
    }

    fn dispatch(&mut self, bindings: &StageBindings, _groups: WorkgroupCount) -> Result<(), TickError> {
        let stage = bindings.stage();
        if self.lost_on_dispatch.remove(&stage) {
            self.programs.remove(&stage);
        }
        if !self.has_program(stage) {
            return Err(TickError::ProgramUnavailable(stage));
        }
        bindings.validate()?;
        for (buffer, _) in bindings.resources() {
            self.buffer(buffer)?;
        }
        self.states.check(bindings)?;
        self.recorded.push(HostCommand::Dispatch(*bindings));
        Ok(())
    }

    fn clear_field(&mut self, buffer: BufferId) -> Result<(), TickError> {
        self.buffer(buffer)?;
        self.recorded.push(HostCommand::Clear(buffer));
        Ok(())
    }

    fn upload_cells(&mut self, target: BufferId, rows: &[(usize, usize)], value: [f32; 4]) -> Result<(), TickError> {
        let buffer = self.buffer(target)?;
        let cells = buffer.dims.cell_count();
        debug_assert_eq!(buffer.kind, SampleKind::Vector4);
        if rows.iter().any(|&(start, len)| start + len > cells) {
            return Err(TickError::RegionOutOfRange(target));
        }
        if self.states.get(target) != Some(ResourceState::CopyDst) {
            return Err(TickError::UploadState { buffer: target, found: self.states.get(target) });
        }
        self.recorded.push(HostCommand::Upload { target, rows: rows.to_vec(), value });
        Ok(())
    }

    fn submit(&mut self) {
        let commands = std::mem::take(&mut self.recorded);
        for command in commands {
            self.execute(command);
        }
    }

    fn discard(&mut self) {
        self.recorded.clear();
    }

    fn begin_readback(&mut self, source: BufferId) -> Result<(), ReadbackError> {
        if self.pending_readback.is_some() {
            return Err(ReadbackError::Busy);
        }
        let buffer = self.buffers.get(source.0 as usize).ok_or(ReadbackError::UnknownBuffer(source))?;
        let found = self.states.get(source);
        if found != Some(ResourceState::CopySrc) {
            return Err(ReadbackError::SourceState { buffer: source, found });
        }
        let data = buffer.data.clone();
        self.pending_readback = Some(PendingReadback { data, polls_left: self.readback_latency });
        Ok(())
    }

    fn poll_readback(&mut self, wait: bool) -> Result<ReadbackPoll, ReadbackError> {
        let pending = self.pending_readback.as_mut().ok_or(ReadbackError::NothingPending)?;
        if !wait && pending.polls_left > 0 {
            pending.polls_left -= 1;
            return Ok(ReadbackPoll::Pending);
        }
        let done = self.pending_readback.take().ok_or(ReadbackError::NothingPending)?;
        Ok(ReadbackPoll::Ready(done.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> GridDims {
        GridDims::cube(4)
    }

    #[test]
    fn nothing_runs_before_submit() {
        let mut host = HostBackend::new();
        let v = host.create_field("v", dims(), SampleKind::Vector4, None).unwrap();
        host.create_program(StageKind::ApplyForces, dims()).unwrap();
        host.write_constants(StageKind::ApplyForces, &SimulationConstants::forces(1.0, [0.0, 2.0, 0.0]))
            .unwrap();
        host.transition(v, ResourceState::ShaderWrite);
        host.dispatch(&StageBindings::ApplyForces { velocity: v }, dims().workgroups()).unwrap();
        assert!(host.buffer_data(v).unwrap().iter().all(|x| *x == 0.0));
        host.submit();
        assert_eq!(&host.buffer_data(v).unwrap()[..4], &[0.0, 2.0, 0.0, 0.0]);
        assert_eq!(host.executed(), &[StageKind::ApplyForces]);
    }

    #[test]
    fn discard_drops_recorded_work() {
        let mut host = HostBackend::new();
        let v = host.create_field("v", dims(), SampleKind::Vector4, None).unwrap();
        host.transition(v, ResourceState::CopyDst);
        assert_eq!(host.state_of(v), Some(ResourceState::CopyDst));
        host.upload_cells(v, &[(0, 2)], [1.0; 4]).unwrap();
        assert_eq!(host.pending_commands(), 1);
        host.discard();
        host.submit();
        assert!(host.buffer_data(v).unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn dispatch_requires_declared_states() {
        let mut host = HostBackend::new();
        let a = host.create_field("a", dims(), SampleKind::Vector4, None).unwrap();
        let b = host.create_field("b", dims(), SampleKind::Vector4, None).unwrap();
        host.create_program(StageKind::Advect, dims()).unwrap();
        host.transition(a, ResourceState::ShaderRead);
        let bindings = StageBindings::Advect { velocity_in: a, velocity_out: b };
        let err = host.dispatch(&bindings, dims().workgroups()).unwrap_err();
        assert_eq!(
            err,
            TickError::ResourceState {
                stage: StageKind::Advect,
                buffer: b,
                expected: ResourceState::ShaderWrite,
                found: None,
            }
        );
        host.transition(b, ResourceState::ShaderWrite);
        assert!(host.dispatch(&bindings, dims().workgroups()).is_ok());
    }

    #[test]
    fn initial_data_must_match_grid() {
        let mut host = HostBackend::new();
        let err = host.create_field("v", dims(), SampleKind::Vector4, Some(&[1.0; 7])).unwrap_err();
        assert!(matches!(err, SetupError::InitialDataSize { expected: 256, actual: 7, .. }));
    }

    #[test]
    fn readback_reports_pending_until_latency_elapses() {
        let mut host = HostBackend::new().with_readback_latency(2);
        let p = host.create_field("p", dims(), SampleKind::Scalar, Some(&[3.0; 64])).unwrap();
        host.transition(p, ResourceState::CopySrc);
        host.begin_readback(p).unwrap();
        assert_eq!(host.begin_readback(p), Err(ReadbackError::Busy));
        assert_eq!(host.poll_readback(false), Ok(ReadbackPoll::Pending));
        assert_eq!(host.poll_readback(false), Ok(ReadbackPoll::Pending));
        assert_eq!(host.poll_readback(false), Ok(ReadbackPoll::Ready(vec![3.0; 64])));
        assert_eq!(host.poll_readback(false), Err(ReadbackError::NothingPending));
    }

    #[test]
    fn readback_requires_copy_source_state() {
        let mut host = HostBackend::new();
        let p = host.create_field("p", dims(), SampleKind::Scalar, None).unwrap();
        assert_eq!(host.begin_readback(p), Err(ReadbackError::SourceState { buffer: p, found: None }));

        host.transition(p, ResourceState::ShaderWrite);
        assert_eq!(
            host.begin_readback(p),
            Err(ReadbackError::SourceState { buffer: p, found: Some(ResourceState::ShaderWrite) })
        );
        assert_eq!(host.poll_readback(true), Err(ReadbackError::NothingPending));

        host.transition(p, ResourceState::CopySrc);
        host.begin_readback(p).unwrap();
        assert_eq!(host.poll_readback(true), Ok(ReadbackPoll::Ready(vec![0.0; 64])));
    }
}
