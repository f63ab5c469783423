//! Owns the fields and drives one full pipeline pass per tick.

use crate::backend::{BufferId, ComputeBackend, ReadbackPoll, ResourceState};
use crate::error::{InjectionError, ReadbackError, SetupError, TickError};
use crate::grid::{CellCoord, CellRegion, GridDims, GridField, SampleKind};
use crate::kernels;
use crate::params::SimulationConstants;
use crate::settings::FluidSettings;
use crate::stage::{PipelineStep, PressureSolveState, StageBindings, StageKind, StagePipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionTarget {
    Center,
    Cell(CellCoord),
}

/// One-shot velocity write applied on the next tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionRequest {
    pub target: InjectionTarget,
    pub value: [f32; 4],
    /// Half-extent of the cube written around the target; 0 is a single cell.
    pub radius: u32,
}

impl InjectionRequest {
    pub fn at_center(value: [f32; 4]) -> Self {
        Self { target: InjectionTarget::Center, value, radius: 0 }
    }

    pub fn at_cell(cell: CellCoord, value: [f32; 4]) -> Self {
        Self { target: InjectionTarget::Cell(cell), value, radius: 0 }
    }

    pub fn with_radius(mut self, radius: u32) -> Self {
        self.radius = radius;
        self
    }

    fn region(&self, dims: GridDims) -> CellRegion {
        let center = match self.target {
            InjectionTarget::Center => dims.center(),
            InjectionTarget::Cell(cell) => cell,
        };
        CellRegion::around(dims, center, self.radius)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelector {
    Velocity,
    Pressure,
    Divergence,
}

/// Authoritative buffers between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontView {
    pub dims: GridDims,
    pub velocity: BufferId,
    pub pressure: BufferId,
    pub divergence: BufferId,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub timestep: f32,
    pub injected: bool,
    pub pressure: PressureSolveState,
}

/// Host copy of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
    pub selector: FieldSelector,
    pub dims: GridDims,
    pub kind: SampleKind,
    pub data: Vec<f32>,
}

impl FieldSnapshot {
    pub fn vector_at(&self, cell: CellCoord) -> Option<[f32; 4]> {
        if self.kind != SampleKind::Vector4 || !self.dims.contains(cell) {
            return None;
        }
        self.vectors().get(self.dims.index(cell)).copied()
    }

    pub fn scalar_at(&self, cell: CellCoord) -> Option<f32> {
        if self.kind != SampleKind::Scalar || !self.dims.contains(cell) {
            return None;
        }
        self.data.get(self.dims.index(cell)).copied()
    }

    /// Vectors as `[f32; 4]` samples; empty for scalar fields. A trailing partial sample is dropped.
    pub fn vectors(&self) -> &[[f32; 4]] {
        match self.kind {
            SampleKind::Vector4 => {
                let whole = self.data.len() - self.data.len() % SampleKind::Vector4.lanes();
                bytemuck::cast_slice(&self.data[..whole])
            }
            SampleKind::Scalar => &[],
        }
    }

    /// L2 norm over scalars, or over the xyz lanes of vectors.
    pub fn l2_norm(&self) -> f32 {
        match self.kind {
            SampleKind::Scalar => kernels::l2_norm(&self.data),
            SampleKind::Vector4 => self
                .vectors()
                .iter()
                .map(|v| v[0] * v[0] + v[1] * v[1] + v[2] * v[2])
                .sum::<f32>()
                .sqrt(),
        }
    }
}

pub struct SimulationController<B: ComputeBackend> {
    backend: B,
    settings: FluidSettings,
    dims: GridDims,
    pipeline: StagePipeline,
    velocity: GridField,
    pressure: GridField,
    divergence: GridField,
    pending_injection: Option<InjectionRequest>,
    pending_readback: Option<FieldSelector>,
    tick: u64,
}

impl<B: ComputeBackend> SimulationController<B> {
    /// Creates every field and compiles every stage program, or fails as a whole.
    pub fn new(mut backend: B, settings: &FluidSettings) -> Result<Self, SetupError> {
        let dims = settings.dims();
        if dims.is_empty() {
            return Err(SetupError::InvalidGrid(dims));
        }

        let initial: Vec<f32> = settings
            .initial_velocity
            .iter()
            .copied()
            .cycle()
            .take(dims.cell_count() * SampleKind::Vector4.lanes())
            .collect();
        let velocity = GridField::double(
            "Velocity",
            dims,
            SampleKind::Vector4,
            backend.create_field("Velocity A", dims, SampleKind::Vector4, Some(&initial))?,
            backend.create_field("Velocity B", dims, SampleKind::Vector4, Some(&initial))?,
        );
        let pressure = GridField::double(
            "Pressure",
            dims,
            SampleKind::Scalar,
            backend.create_field("Pressure A", dims, SampleKind::Scalar, None)?,
            backend.create_field("Pressure B", dims, SampleKind::Scalar, None)?,
        );
        let divergence = GridField::single(
            "Divergence",
            dims,
            SampleKind::Scalar,
            backend.create_field("Divergence", dims, SampleKind::Scalar, None)?,
        );

        for field in [&velocity, &pressure, &divergence] {
            log::debug!(
                "{} field: buffers {:?}, {} bytes each, double buffered: {}",
                field.label(),
                field.buffers(),
                field.byte_size(),
                field.is_double_buffered()
            );
        }

        for stage in StageKind::ALL {
            backend.create_program(stage, dims)?;
        }

        let pipeline = StagePipeline::new(settings.jacobi_iterations, settings.warm_start_pressure);
        log::info!(
            "Simulation grid {}x{}x{} ({} cells), {} dispatches per tick",
            dims.nx,
            dims.ny,
            dims.nz,
            dims.cell_count(),
            pipeline.dispatch_count()
        );

        Ok(Self {
            backend,
            settings: settings.clone(),
            dims,
            pipeline,
            velocity,
            pressure,
            divergence,
            pending_injection: None,
            pending_readback: None,
            tick: 0,
        })
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn settings(&self) -> &FluidSettings {
        &self.settings
    }

    pub fn pipeline(&self) -> &StagePipeline {
        &self.pipeline
    }

    /// Completed ticks.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn front(&self) -> FrontView {
        FrontView {
            dims: self.dims,
            velocity: self.velocity.read(),
            pressure: self.pressure.read(),
            divergence: self.divergence.read(),
        }
    }

    pub fn pending_injection(&self) -> Option<&InjectionRequest> {
        self.pending_injection.as_ref()
    }

    /// Replaces any request not yet consumed by a tick.
    pub fn request_injection(&mut self, request: InjectionRequest) -> Result<(), InjectionError> {
        if let InjectionTarget::Cell(cell) = request.target {
            if !self.dims.contains(cell) {
                return Err(InjectionError::OutOfBounds { cell, dims: self.dims });
            }
        }
        self.pending_injection = Some(request);
        Ok(())
    }

    /// Records and submits one tick. On error nothing is submitted and buffer roles are unchanged.
    pub fn advance(&mut self, elapsed: f32) -> Result<TickReport, TickError> {
        for stage in self.pipeline.stages() {
            if !self.backend.has_program(stage) {
                return Err(TickError::ProgramUnavailable(stage));
            }
        }

        let timestep = self.settings.timestep_for(elapsed);
        let fronts = (self.velocity.front(), self.pressure.front());
        let injection = self.pending_injection.take();

        match self.record(timestep, injection.as_ref()) {
            Ok(pressure) => {
                self.backend.submit();
                self.tick += 1;
                let report = TickReport { tick: self.tick, timestep, injected: injection.is_some(), pressure };
                log::debug!("{report:?}");
                Ok(report)
            }
            Err(err) => {
                self.backend.discard();
                self.velocity.restore_front(fronts.0);
                self.pressure.restore_front(fronts.1);
                self.pending_injection = injection;
                log::warn!("Tick {} aborted: {err}", self.tick + 1);
                Err(err)
            }
        }
    }

    fn record(&mut self, timestep: f32, injection: Option<&InjectionRequest>) -> Result<PressureSolveState, TickError> {
        let dims = self.dims;
        let groups = dims.workgroups();
        let mut solve = PressureSolveState::Idle;

        for step in self.pipeline.steps().to_vec() {
            match step {
                PipelineStep::AdvectConstants => {
                    self.backend
                        .write_constants(StageKind::Advect, &SimulationConstants::advect(timestep, dims))?;
                }
                PipelineStep::ForceConstants => {
                    self.backend.write_constants(
                        StageKind::ApplyForces,
                        &SimulationConstants::forces(timestep, self.settings.force),
                    )?;
                }
                PipelineStep::Advect => {
                    self.backend.transition(self.velocity.read(), ResourceState::ShaderRead);
                    self.backend.transition(self.velocity.write(), ResourceState::ShaderWrite);
                    self.backend.dispatch(
                        &StageBindings::Advect {
                            velocity_in: self.velocity.read(),
                            velocity_out: self.velocity.write(),
                        },
                        groups,
                    )?;
                }
                PipelineStep::Inject => {
                    if let Some(request) = injection {
                        let rows = request.region(dims).rows(dims);
                        self.backend.transition(self.velocity.write(), ResourceState::CopyDst);
                        self.backend.upload_cells(self.velocity.write(), &rows, request.value)?;
                    }
                }
                PipelineStep::ApplyForces => {
                    self.backend.transition(self.velocity.write(), ResourceState::ShaderWrite);
                    self.backend
                        .dispatch(&StageBindings::ApplyForces { velocity: self.velocity.write() }, groups)?;
                }
                PipelineStep::Divergence => {
                    // Post-force velocity still sits in the write slot.
                    self.backend.transition(self.velocity.write(), ResourceState::ShaderRead);
                    self.backend.transition(self.divergence.write(), ResourceState::ShaderWrite);
                    self.backend.dispatch(
                        &StageBindings::Divergence {
                            velocity: self.velocity.write(),
                            divergence: self.divergence.write(),
                        },
                        groups,
                    )?;
                }
                PipelineStep::ClearPressure => {
                    for buffer in self.pressure.buffers() {
                        self.backend.transition(buffer, ResourceState::CopyDst);
                        self.backend.clear_field(buffer)?;
                    }
                }
                PipelineStep::PressureSolve { iterations } => {
                    self.backend.transition(self.divergence.read(), ResourceState::ShaderRead);
                    solve = solve.advance(iterations);
                    while let PressureSolveState::Iterating(_) = solve {
                        self.record_jacobi_sweep()?;
                        solve = solve.advance(iterations);
                    }
                }
                PipelineStep::Project => {
                    self.backend.transition(self.pressure.read(), ResourceState::ShaderRead);
                    self.backend.transition(self.velocity.write(), ResourceState::ShaderWrite);
                    self.backend.dispatch(
                        &StageBindings::Project {
                            pressure: self.pressure.read(),
                            velocity: self.velocity.write(),
                        },
                        groups,
                    )?;
                }
                PipelineStep::SwapVelocity => self.velocity.swap(),
            }
        }
        Ok(solve)
    }

    /// One relaxation step followed by the pressure swap.
    fn record_jacobi_sweep(&mut self) -> Result<(), TickError> {
        self.backend.transition(self.pressure.read(), ResourceState::ShaderRead);
        self.backend.transition(self.pressure.write(), ResourceState::ShaderWrite);
        self.backend.dispatch(
            &StageBindings::Jacobi {
                pressure_in: self.pressure.read(),
                divergence: self.divergence.read(),
                pressure_out: self.pressure.write(),
            },
            self.dims.workgroups(),
        )?;
        self.pressure.swap();
        Ok(())
    }

    fn field(&self, selector: FieldSelector) -> &GridField {
        match selector {
            FieldSelector::Velocity => &self.velocity,
            FieldSelector::Pressure => &self.pressure,
            FieldSelector::Divergence => &self.divergence,
        }
    }

    /// Starts copying the current front of `selector` to the host.
    pub fn request_readback(&mut self, selector: FieldSelector) -> Result<(), ReadbackError> {
        if self.pending_readback.is_some() {
            return Err(ReadbackError::Busy);
        }
        let source = self.field(selector).read();
        self.backend.transition(source, ResourceState::CopySrc);
        self.backend.begin_readback(source)?;
        self.pending_readback = Some(selector);
        Ok(())
    }

    /// `Ok(None)` while the copy is still in flight.
    pub fn poll_readback(&mut self) -> Result<Option<FieldSnapshot>, ReadbackError> {
        let selector = self.pending_readback.ok_or(ReadbackError::NothingPending)?;
        match self.backend.poll_readback(false) {
            Ok(ReadbackPoll::Pending) => Ok(None),
            Ok(ReadbackPoll::Ready(data)) => {
                self.pending_readback = None;
                Ok(Some(self.snapshot(selector, data)))
            }
            Err(err) => {
                self.pending_readback = None;
                log::warn!("Readback of {selector:?} failed: {err}");
                Err(err)
            }
        }
    }

    /// Blocking readback of the current front of `selector`.
    pub fn read_field(&mut self, selector: FieldSelector) -> Result<FieldSnapshot, ReadbackError> {
        self.request_readback(selector)?;
        loop {
            match self.backend.poll_readback(true) {
                Ok(ReadbackPoll::Pending) => continue,
                Ok(ReadbackPoll::Ready(data)) => {
                    self.pending_readback = None;
                    return Ok(self.snapshot(selector, data));
                }
                Err(err) => {
                    self.pending_readback = None;
                    log::warn!("Readback of {selector:?} failed: {err}");
                    return Err(err);
                }
            }
        }
    }

    fn snapshot(&self, selector: FieldSelector, data: Vec<f32>) -> FieldSnapshot {
        let field = self.field(selector);
        FieldSnapshot { selector, dims: field.dims(), kind: field.kind(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;

    fn small_settings() -> FluidSettings {
        FluidSettings { grid_size: [6, 6, 6], jacobi_iterations: 4, ..Default::default() }
    }

    #[test]
    fn center_request_covers_clipped_cube() {
        let dims = GridDims::cube(4);
        let region = InjectionRequest::at_center([0.0; 4]).with_radius(3).region(dims);
        assert_eq!(region.cell_count(), dims.cell_count());
    }

    #[test]
    fn out_of_grid_injection_is_rejected() {
        let mut sim = SimulationController::new(HostBackend::new(), &small_settings()).unwrap();
        let cell = CellCoord::new(6, 0, 0);
        assert_eq!(
            sim.request_injection(InjectionRequest::at_cell(cell, [1.0; 4])),
            Err(InjectionError::OutOfBounds { cell, dims: GridDims::cube(6) })
        );
        assert!(sim.pending_injection().is_none());
    }

    #[test]
    fn injection_is_consumed_by_one_tick() {
        let mut sim = SimulationController::new(HostBackend::new(), &small_settings()).unwrap();
        sim.request_injection(InjectionRequest::at_center([0.0, 1.0, 0.0, 1.0])).unwrap();
        assert!(sim.advance(0.016).unwrap().injected);
        assert!(sim.pending_injection().is_none());
        assert!(!sim.advance(0.016).unwrap().injected);
    }

    #[test]
    fn velocity_front_flips_every_tick() {
        let mut sim = SimulationController::new(HostBackend::new(), &small_settings()).unwrap();
        let before = sim.front();
        let report = sim.advance(0.016).unwrap();
        assert_eq!(report.tick, 1);
        assert_eq!(report.pressure, PressureSolveState::Truncated(4));
        assert_ne!(sim.front().velocity, before.velocity);
        // even iteration count returns pressure to the same buffer
        assert_eq!(sim.front().pressure, before.pressure);
        assert_eq!(sim.front().divergence, before.divergence);
    }

    #[test]
    fn snapshot_accessors_respect_kind() {
        let snapshot = FieldSnapshot {
            selector: FieldSelector::Pressure,
            dims: GridDims::cube(2),
            kind: SampleKind::Scalar,
            data: vec![3.0, 4.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        };
        assert_eq!(snapshot.scalar_at(CellCoord::new(1, 0, 0)), Some(4.0));
        assert_eq!(snapshot.vector_at(CellCoord::new(1, 0, 0)), None);
        assert_eq!(snapshot.scalar_at(CellCoord::new(2, 0, 0)), None);
        assert_eq!(snapshot.l2_norm(), 5.0);
    }

    #[test]
    fn short_snapshot_data_yields_none() {
        let vectors = FieldSnapshot {
            selector: FieldSelector::Velocity,
            dims: GridDims::cube(2),
            kind: SampleKind::Vector4,
            data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        };
        assert_eq!(vectors.vectors(), &[[1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(vectors.vector_at(CellCoord::new(0, 0, 0)), Some([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(vectors.vector_at(CellCoord::new(1, 0, 0)), None);

        let scalars = FieldSnapshot {
            selector: FieldSelector::Pressure,
            dims: GridDims::cube(2),
            kind: SampleKind::Scalar,
            data: vec![1.0],
        };
        assert_eq!(scalars.scalar_at(CellCoord::new(1, 1, 1)), None);
    }

    #[test]
    fn readback_declares_copy_source() {
        let mut sim = SimulationController::new(HostBackend::new(), &small_settings()).unwrap();
        sim.advance(0.016).unwrap();
        let front = sim.front();
        sim.read_field(FieldSelector::Pressure).unwrap();
        assert_eq!(sim.backend().state_of(front.pressure), Some(ResourceState::CopySrc));
        // the next tick redeclares every bound buffer
        sim.advance(0.016).unwrap();
        assert_eq!(sim.tick(), 2);
    }
}
