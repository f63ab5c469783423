//! Compute stages and their ordering within a tick.

use std::fmt;

use crate::backend::{BufferId, ResourceState};
use crate::error::TickError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    Advect,
    ApplyForces,
    Divergence,
    Jacobi,
    Project,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Advect,
        StageKind::ApplyForces,
        StageKind::Divergence,
        StageKind::Jacobi,
        StageKind::Project,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Advect => "Advect",
            StageKind::ApplyForces => "Apply Forces",
            StageKind::Divergence => "Divergence",
            StageKind::Jacobi => "Jacobi Pressure",
            StageKind::Project => "Project",
        }
    }

    /// WGSL source, prefixed by shaders/common.wgsl when compiled.
    pub fn shader_source(&self) -> &'static str {
        match self {
            StageKind::Advect => include_str!("../shaders/advect.wgsl"),
            StageKind::ApplyForces => include_str!("../shaders/apply_forces.wgsl"),
            StageKind::Divergence => include_str!("../shaders/divergence.wgsl"),
            StageKind::Jacobi => include_str!("../shaders/jacobi.wgsl"),
            StageKind::Project => include_str!("../shaders/project.wgsl"),
        }
    }

    /// Access of each storage binding, starting at binding 1.
    pub fn binding_access(&self) -> &'static [Access] {
        match self {
            StageKind::Advect => &[Access::Read, Access::ReadWrite],
            StageKind::ApplyForces => &[Access::ReadWrite],
            StageKind::Divergence => &[Access::Read, Access::ReadWrite],
            StageKind::Jacobi => &[Access::Read, Access::Read, Access::ReadWrite],
            StageKind::Project => &[Access::Read, Access::ReadWrite],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");

pub fn compose_shader(stage: StageKind) -> String {
    let mut source = String::with_capacity(COMMON_WGSL.len() + stage.shader_source().len() + 1);
    source.push_str(COMMON_WGSL);
    source.push('\n');
    source.push_str(stage.shader_source());
    source
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

impl Access {
    pub fn required_state(&self) -> ResourceState {
        match self {
            Access::Read => ResourceState::ShaderRead,
            Access::ReadWrite => ResourceState::ShaderWrite,
        }
    }
}

/// Field views handed to one dispatch, in shader binding order (binding 0 is the uniform).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageBindings {
    Advect { velocity_in: BufferId, velocity_out: BufferId },
    ApplyForces { velocity: BufferId },
    Divergence { velocity: BufferId, divergence: BufferId },
    Jacobi { pressure_in: BufferId, divergence: BufferId, pressure_out: BufferId },
    Project { pressure: BufferId, velocity: BufferId },
}

impl StageBindings {
    pub fn stage(&self) -> StageKind {
        match self {
            StageBindings::Advect { .. } => StageKind::Advect,
            StageBindings::ApplyForces { .. } => StageKind::ApplyForces,
            StageBindings::Divergence { .. } => StageKind::Divergence,
            StageBindings::Jacobi { .. } => StageKind::Jacobi,
            StageBindings::Project { .. } => StageKind::Project,
        }
    }

    pub fn resources(&self) -> Vec<(BufferId, Access)> {
        match *self {
            StageBindings::Advect { velocity_in, velocity_out } => {
                vec![(velocity_in, Access::Read), (velocity_out, Access::ReadWrite)]
            }
            StageBindings::ApplyForces { velocity } => vec![(velocity, Access::ReadWrite)],
            StageBindings::Divergence { velocity, divergence } => {
                vec![(velocity, Access::Read), (divergence, Access::ReadWrite)]
            }
            StageBindings::Jacobi { pressure_in, divergence, pressure_out } => vec![
                (pressure_in, Access::Read),
                (divergence, Access::Read),
                (pressure_out, Access::ReadWrite),
            ],
            StageBindings::Project { pressure, velocity } => {
                vec![(pressure, Access::Read), (velocity, Access::ReadWrite)]
            }
        }
    }

    /// A buffer bound writable must not also be bound as a read view.
    pub fn validate(&self) -> Result<(), TickError> {
        let resources = self.resources();
        for (i, &(a, access_a)) in resources.iter().enumerate() {
            for &(b, access_b) in &resources[i + 1..] {
                if a == b && (access_a == Access::ReadWrite || access_b == Access::ReadWrite) {
                    return Err(TickError::AliasedBindings { stage: self.stage(), buffer: a });
                }
            }
        }
        Ok(())
    }
}

/// Where the pressure solve ended up for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureSolveState {
    Idle,
    Iterating(u32),
    /// Nothing left to relax (zero iterations configured).
    Converged,
    /// Stopped at the fixed iteration count.
    Truncated(u32),
}

impl PressureSolveState {
    pub fn advance(self, budget: u32) -> Self {
        match self {
            PressureSolveState::Idle if budget == 0 => PressureSolveState::Converged,
            PressureSolveState::Idle => PressureSolveState::Iterating(0),
            PressureSolveState::Iterating(k) if k + 1 >= budget => PressureSolveState::Truncated(k + 1),
            PressureSolveState::Iterating(k) => PressureSolveState::Iterating(k + 1),
            done => done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    /// Timestep and advection scale for Advect.
    AdvectConstants,
    Advect,
    Inject,
    /// Timestep and external force for ApplyForces.
    ForceConstants,
    ApplyForces,
    Divergence,
    ClearPressure,
    PressureSolve { iterations: u32 },
    Project,
    SwapVelocity,
}

impl PipelineStep {
    /// Stage this step dispatches exactly once.
    pub fn single_dispatch(&self) -> Option<StageKind> {
        match self {
            PipelineStep::Advect => Some(StageKind::Advect),
            PipelineStep::ApplyForces => Some(StageKind::ApplyForces),
            PipelineStep::Divergence => Some(StageKind::Divergence),
            PipelineStep::Project => Some(StageKind::Project),
            _ => None,
        }
    }
}

/// Fixed per-tick ordering of writes, dispatches, injection and swaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePipeline {
    steps: Vec<PipelineStep>,
}

impl StagePipeline {
    pub fn new(jacobi_iterations: u32, warm_start_pressure: bool) -> Self {
        let mut steps = vec![
            PipelineStep::AdvectConstants,
            PipelineStep::Advect,
            PipelineStep::Inject,
            PipelineStep::ForceConstants,
            PipelineStep::ApplyForces,
            PipelineStep::Divergence,
        ];
        if !warm_start_pressure {
            steps.push(PipelineStep::ClearPressure);
        }
        steps.push(PipelineStep::PressureSolve { iterations: jacobi_iterations });
        steps.push(PipelineStep::Project);
        steps.push(PipelineStep::SwapVelocity);
        Self { steps }
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Stages the pipeline dispatches at least once.
    pub fn stages(&self) -> Vec<StageKind> {
        let mut stages: Vec<StageKind> = self
            .steps
            .iter()
            .filter_map(|step| match step {
                PipelineStep::PressureSolve { iterations } if *iterations > 0 => Some(StageKind::Jacobi),
                other => other.single_dispatch(),
            })
            .collect();
        stages.sort();
        stages.dedup();
        stages
    }

    /// Dispatches recorded per tick.
    pub fn dispatch_count(&self) -> u32 {
        self.steps
            .iter()
            .map(|step| match step {
                PipelineStep::PressureSolve { iterations } => *iterations,
                other => u32::from(other.single_dispatch().is_some()),
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_order_is_advect_inject_forces_divergence_solve_project() {
        let pipeline = StagePipeline::new(40, true);
        assert_eq!(
            pipeline.steps(),
            &[
                PipelineStep::AdvectConstants,
                PipelineStep::Advect,
                PipelineStep::Inject,
                PipelineStep::ForceConstants,
                PipelineStep::ApplyForces,
                PipelineStep::Divergence,
                PipelineStep::PressureSolve { iterations: 40 },
                PipelineStep::Project,
                PipelineStep::SwapVelocity,
            ]
        );
        assert_eq!(pipeline.dispatch_count(), 44);
        assert_eq!(pipeline.stages(), StageKind::ALL.to_vec());
    }

    #[test]
    fn cold_start_clears_pressure_before_solving() {
        let pipeline = StagePipeline::new(4, false);
        let clear = pipeline.steps().iter().position(|s| *s == PipelineStep::ClearPressure);
        let solve = pipeline
            .steps()
            .iter()
            .position(|s| matches!(s, PipelineStep::PressureSolve { .. }));
        assert!(clear.unwrap() < solve.unwrap());
    }

    #[test]
    fn zero_iterations_drops_jacobi_stage() {
        let pipeline = StagePipeline::new(0, true);
        assert!(!pipeline.stages().contains(&StageKind::Jacobi));
        assert_eq!(pipeline.dispatch_count(), 4);
        assert_eq!(PressureSolveState::Idle.advance(0), PressureSolveState::Converged);
    }

    #[test]
    fn solve_state_truncates_at_budget() {
        let mut state = PressureSolveState::Idle;
        state = state.advance(3);
        assert_eq!(state, PressureSolveState::Iterating(0));
        state = state.advance(3);
        state = state.advance(3);
        state = state.advance(3);
        assert_eq!(state, PressureSolveState::Truncated(3));
        assert_eq!(state.advance(3), PressureSolveState::Truncated(3));
    }

    #[test]
    fn aliased_write_binding_is_rejected() {
        let bindings = StageBindings::Advect { velocity_in: BufferId(0), velocity_out: BufferId(0) };
        assert_eq!(
            bindings.validate(),
            Err(TickError::AliasedBindings { stage: StageKind::Advect, buffer: BufferId(0) })
        );
        let ok = StageBindings::Jacobi {
            pressure_in: BufferId(1),
            divergence: BufferId(2),
            pressure_out: BufferId(3),
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn layout_access_matches_bindings() {
        let bindings = [
            StageBindings::Advect { velocity_in: BufferId(0), velocity_out: BufferId(1) },
            StageBindings::ApplyForces { velocity: BufferId(0) },
            StageBindings::Divergence { velocity: BufferId(0), divergence: BufferId(1) },
            StageBindings::Jacobi { pressure_in: BufferId(0), divergence: BufferId(1), pressure_out: BufferId(2) },
            StageBindings::Project { pressure: BufferId(0), velocity: BufferId(1) },
        ];
        for b in bindings {
            let access: Vec<Access> = b.resources().into_iter().map(|(_, a)| a).collect();
            assert_eq!(access, b.stage().binding_access());
        }
    }
}
