use gridflow::backend::{ComputeBackend, ResourceState};
use gridflow::grid::{CellCoord, GridDims, SampleKind};
use gridflow::kernels;
use gridflow::stage::StageBindings;
use gridflow::{
    FieldSelector, FluidSettings, HostBackend, InjectionRequest, PressureSolveState, SetupError, SimulationController,
    StageKind, TickError,
};

fn settings(n: u32, jacobi_iterations: u32) -> FluidSettings {
    FluidSettings { grid_size: [n, n, n], jacobi_iterations, ..Default::default() }
}

fn approx(a: f32, b: f32, eps: f32) -> bool {
    (a - b).abs() <= eps
}

#[test]
fn injection_lands_before_forces() {
    let settings = settings(8, 40);
    let mut backend = HostBackend::new();
    backend.capture_after(StageKind::ApplyForces);
    let mut sim = SimulationController::new(backend, &settings).unwrap();

    sim.request_injection(InjectionRequest::at_center([0.0, 5.0, 0.0, 1.0])).unwrap();
    let report = sim.advance(0.0).unwrap();
    assert!(report.injected);

    let dims = sim.dims();
    let dv = settings.force[1] * settings.timestep;
    let after_forces: &[[f32; 4]] = bytemuck::cast_slice(sim.backend().captured(StageKind::ApplyForces).unwrap());

    let center = after_forces[dims.index(dims.center())];
    assert!(approx(center[0], 0.0, 1e-6));
    assert!(approx(center[1], 5.0 + dv, 1e-5));
    assert!(approx(center[2], 0.0, 1e-6));
    assert_eq!(center[3], 1.0);

    // neighbors carry the advected uniform flow
    let c = dims.center();
    let beside = after_forces[dims.index(CellCoord::new(c.x + 1, c.y, c.z))];
    assert!(approx(beside[0], 1.0, 1e-5));
    assert!(approx(beside[1], dv, 1e-5));
}

#[test]
fn solve_and_project_reduce_divergence() {
    let settings = settings(8, 40);
    let mut backend = HostBackend::new();
    backend.capture_after(StageKind::Divergence);
    let mut sim = SimulationController::new(backend, &settings).unwrap();
    sim.request_injection(InjectionRequest::at_center([0.0, 5.0, 0.0, 1.0])).unwrap();
    sim.advance(0.0).unwrap();

    let dims = sim.dims();
    let before = kernels::l2_norm(sim.backend().captured(StageKind::Divergence).unwrap());
    let velocity = sim.read_field(FieldSelector::Velocity).unwrap();
    let mut after = vec![0.0; dims.cell_count()];
    kernels::divergence(dims, velocity.vectors(), &mut after);

    assert!(before > 1.0);
    assert!(kernels::l2_norm(&after) < before);
}

#[test]
fn rotation_is_divergence_free_away_from_walls() {
    let dims = GridDims::cube(8);
    let c = 3.5f32;
    let rotation: Vec<f32> = dims
        .iter()
        .flat_map(|cell| [-(cell.y as f32 - c), cell.x as f32 - c, 0.0, 0.0])
        .collect();

    let mut host = HostBackend::new();
    let velocity = host.create_field("rotation", dims, SampleKind::Vector4, Some(&rotation)).unwrap();
    let divergence = host.create_field("divergence", dims, SampleKind::Scalar, None).unwrap();
    host.create_program(StageKind::Divergence, dims).unwrap();
    host.transition(velocity, ResourceState::ShaderRead);
    host.transition(divergence, ResourceState::ShaderWrite);
    host.dispatch(&StageBindings::Divergence { velocity, divergence }, dims.workgroups()).unwrap();
    host.submit();

    let div = host.buffer_data(divergence).unwrap();
    for cell in dims.iter() {
        let interior = [cell.x, cell.y, cell.z].iter().all(|&v| v > 0 && v < 7);
        if interior {
            assert!(div[dims.index(cell)].abs() < 1e-5, "cell {cell:?}");
        }
    }
}

#[test]
fn converged_pressure_is_a_fixed_point() {
    let dims = GridDims::cube(6);
    let mut div = vec![0.0; dims.cell_count()];
    div[dims.index(CellCoord::new(1, 2, 3))] = 1.0;
    div[dims.index(CellCoord::new(4, 3, 2))] = -0.5;

    let mut a = vec![0.0; dims.cell_count()];
    let mut b = vec![0.0; dims.cell_count()];
    let converged = kernels::solve_pressure(dims, &mut a, &mut b, &div, 2000).clone();

    let mut front = converged.clone();
    let mut back = vec![0.0; dims.cell_count()];
    assert_eq!(*kernels::solve_pressure(dims, &mut front, &mut back, &div, 0), converged);

    let mut front = converged.clone();
    let mut back = vec![0.0; dims.cell_count()];
    let more = kernels::solve_pressure(dims, &mut front, &mut back, &div, 40);
    for (x, y) in more.iter().zip(&converged) {
        assert!(approx(*x, *y, 1e-5));
    }
}

/// Pressure after the second tick, computed on the host from the first tick's result.
fn second_tick_pressure(warm_start: bool) -> (Vec<f32>, Vec<f32>) {
    let settings = FluidSettings { warm_start_pressure: warm_start, ..settings(6, 5) };
    let mut backend = HostBackend::new();
    backend.capture_after(StageKind::Divergence);
    let mut sim = SimulationController::new(backend, &settings).unwrap();

    sim.advance(0.0).unwrap();
    let first = sim.read_field(FieldSelector::Pressure).unwrap().data;
    let report = sim.advance(0.0).unwrap();
    assert_eq!(report.pressure, PressureSolveState::Truncated(5));
    let div = sim.backend().captured(StageKind::Divergence).unwrap().to_vec();
    let second = sim.read_field(FieldSelector::Pressure).unwrap().data;

    let dims = sim.dims();
    let mut front = if warm_start { first } else { vec![0.0; dims.cell_count()] };
    let mut back = vec![0.0; dims.cell_count()];
    let expected = kernels::solve_pressure(dims, &mut front, &mut back, &div, 5).clone();
    (second, expected)
}

#[test]
fn warm_start_carries_pressure_between_ticks() {
    let (warm, expected_warm) = second_tick_pressure(true);
    let (cold, expected_cold) = second_tick_pressure(false);
    for (x, y) in warm.iter().zip(&expected_warm) {
        assert!(approx(*x, *y, 1e-6));
    }
    for (x, y) in cold.iter().zip(&expected_cold) {
        assert!(approx(*x, *y, 1e-6));
    }
    assert!(warm.iter().zip(&cold).any(|(x, y)| !approx(*x, *y, 1e-6)));
}

#[test]
fn tick_dispatches_every_stage_in_order() {
    let mut sim = SimulationController::new(HostBackend::new(), &settings(8, 40)).unwrap();
    let report = sim.advance(0.0).unwrap();
    assert_eq!(report.pressure, PressureSolveState::Truncated(40));

    let executed = sim.backend().executed();
    assert_eq!(executed.len(), 44);
    assert_eq!(sim.pipeline().dispatch_count(), 44);
    assert_eq!(&executed[..3], &[StageKind::Advect, StageKind::ApplyForces, StageKind::Divergence]);
    assert!(executed[3..43].iter().all(|s| *s == StageKind::Jacobi));
    assert_eq!(executed[43], StageKind::Project);
}

#[test]
fn zero_iterations_converge_immediately() {
    let mut sim = SimulationController::new(HostBackend::new(), &settings(4, 0)).unwrap();
    let report = sim.advance(0.0).unwrap();
    assert_eq!(report.pressure, PressureSolveState::Converged);
    assert!(!sim.backend().executed().contains(&StageKind::Jacobi));
}

#[test]
fn frame_time_drives_timestep_when_enabled() {
    let settings = FluidSettings { use_frame_time: true, ..settings(4, 2) };
    let mut sim = SimulationController::new(HostBackend::new(), &settings).unwrap();
    assert_eq!(sim.advance(1.0).unwrap().timestep, 1.0 / 30.0);
    assert_eq!(sim.advance(0.01).unwrap().timestep, 0.01);
}

#[test]
fn missing_program_aborts_before_recording() {
    let mut sim = SimulationController::new(HostBackend::new(), &settings(6, 3)).unwrap();
    sim.backend_mut().evict_program(StageKind::Divergence);
    let before = sim.front();

    assert_eq!(sim.advance(0.0), Err(TickError::ProgramUnavailable(StageKind::Divergence)));
    assert_eq!(sim.front(), before);
    assert_eq!(sim.tick(), 0);
    assert!(sim.backend().executed().is_empty());
    assert_eq!(sim.backend().pending_commands(), 0);
}

#[test]
fn failure_while_recording_restores_roles_and_request() {
    let mut sim = SimulationController::new(HostBackend::new(), &settings(6, 3)).unwrap();
    let velocity_before = sim.read_field(FieldSelector::Velocity).unwrap();
    let request = InjectionRequest::at_center([0.0, 5.0, 0.0, 1.0]);
    sim.request_injection(request).unwrap();
    sim.backend_mut().lose_program_on_dispatch(StageKind::Project);
    let before = sim.front();

    // three jacobi swaps were recorded before project failed
    assert_eq!(sim.advance(0.0), Err(TickError::ProgramUnavailable(StageKind::Project)));
    assert_eq!(sim.front(), before);
    assert_eq!(sim.pending_injection(), Some(&request));
    assert!(sim.backend().executed().is_empty());
    assert_eq!(sim.backend().pending_commands(), 0);
    assert_eq!(sim.read_field(FieldSelector::Velocity).unwrap(), velocity_before);
}

#[test]
fn setup_failures_propagate() {
    let err = SimulationController::new(HostBackend::new().with_broken_program(StageKind::Jacobi), &settings(4, 4))
        .err()
        .unwrap();
    assert!(matches!(err, SetupError::ShaderCompilation { stage: StageKind::Jacobi, .. }));

    let empty = FluidSettings { grid_size: [0, 4, 4], ..Default::default() };
    let err = SimulationController::new(HostBackend::new(), &empty).err().unwrap();
    assert!(matches!(err, SetupError::InvalidGrid(_)));
}

#[test]
fn readback_is_pending_until_ready() {
    let backend = HostBackend::new().with_readback_latency(2);
    let mut sim = SimulationController::new(backend, &settings(6, 4)).unwrap();
    sim.advance(0.0).unwrap();

    sim.request_readback(FieldSelector::Pressure).unwrap();
    assert_eq!(sim.request_readback(FieldSelector::Velocity), Err(gridflow::ReadbackError::Busy));
    assert_eq!(sim.poll_readback(), Ok(None));
    assert_eq!(sim.poll_readback(), Ok(None));

    let snapshot = sim.poll_readback().unwrap().unwrap();
    assert_eq!(snapshot.selector, FieldSelector::Pressure);
    assert_eq!(snapshot.kind, SampleKind::Scalar);
    assert_eq!(snapshot.data.len(), 216);
    assert!(snapshot.l2_norm() > 0.0);
    assert_eq!(sim.poll_readback(), Err(gridflow::ReadbackError::NothingPending));
}
