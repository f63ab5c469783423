use bytemuck::{Pod, Zeroable};

use crate::grid::GridDims;

/// Per-dispatch stage parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SimulationConstants {
    pub timestep: f32,
    /// Force for ApplyForces, per-axis advection scale for Advect.
    pub vector: [f32; 3],
}

impl SimulationConstants {
    pub fn advect(timestep: f32, dims: GridDims) -> Self {
        Self { timestep, vector: dims.inverse_size() }
    }

    pub fn forces(timestep: f32, force: [f32; 3]) -> Self {
        Self { timestep, vector: force }
    }
}

/// Uniform layout shared by every compute program (`StageConstants` in shaders/common.wgsl).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct StageUniform {
    pub dims: [u32; 4],
    pub timestep: f32,
    pub _pad: [f32; 3],
    pub vector: [f32; 4],
}

impl StageUniform {
    pub fn new(dims: GridDims, constants: &SimulationConstants) -> Self {
        Self {
            dims: [dims.nx, dims.ny, dims.nz, dims.cell_count() as u32],
            timestep: constants.timestep,
            _pad: [0.0; 3],
            vector: [constants.vector[0], constants.vector[1], constants.vector[2], 0.0],
        }
    }

    pub fn grid_only(dims: GridDims) -> Self {
        Self::new(dims, &SimulationConstants::default())
    }

    pub fn constants(&self) -> SimulationConstants {
        SimulationConstants {
            timestep: self.timestep,
            vector: [self.vector[0], self.vector[1], self.vector[2]],
        }
    }
}

/// Viewer uniform for shaders/volume_view.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ViewParams {
    pub dims: [u32; 4],
    pub slice: u32,
    pub mode: u32,
    pub _pad: [u32; 2],
    // velocity, pressure, divergence scales
    pub scale: [f32; 4],
}
