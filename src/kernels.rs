//! Host reference implementations of the compute stages.
//!
//! These mirror shaders/*.wgsl cell for cell. Out-of-range neighbors read as zero
//! velocity / zero pressure; advection sample points are clamped to the grid.

use crate::grid::{CellCoord, GridDims};
use crate::params::SimulationConstants;

pub type Vec4 = [f32; 4];

fn velocity_or_zero(dims: GridDims, velocity: &[Vec4], cell: CellCoord, dx: i32, dy: i32, dz: i32) -> Vec4 {
    dims.offset(cell, dx, dy, dz).map_or([0.0; 4], |i| velocity[i])
}

fn pressure_or_zero(dims: GridDims, pressure: &[f32], cell: CellCoord, dx: i32, dy: i32, dz: i32) -> f32 {
    dims.offset(cell, dx, dy, dz).map_or(0.0, |i| pressure[i])
}

/// Trilinear sample at a cell-space position, clamped to [0, n-1] per axis.
pub fn sample_trilinear(dims: GridDims, field: &[Vec4], pos: [f32; 3]) -> Vec4 {
    let n = [dims.nx, dims.ny, dims.nz];
    let mut lo = [0u32; 3];
    let mut hi = [0u32; 3];
    let mut t = [0.0f32; 3];
    for axis in 0..3 {
        let max = (n[axis] - 1) as f32;
        let p = pos[axis].clamp(0.0, max);
        let base = p.floor();
        lo[axis] = base as u32;
        hi[axis] = (lo[axis] + 1).min(n[axis] - 1);
        t[axis] = p - base;
    }
    let at = |x: u32, y: u32, z: u32| field[dims.index(CellCoord::new(x, y, z))];
    let lerp = |a: Vec4, b: Vec4, f: f32| -> Vec4 {
        [
            a[0] + (b[0] - a[0]) * f,
            a[1] + (b[1] - a[1]) * f,
            a[2] + (b[2] - a[2]) * f,
            a[3] + (b[3] - a[3]) * f,
        ]
    };
    let c00 = lerp(at(lo[0], lo[1], lo[2]), at(hi[0], lo[1], lo[2]), t[0]);
    let c10 = lerp(at(lo[0], hi[1], lo[2]), at(hi[0], hi[1], lo[2]), t[0]);
    let c01 = lerp(at(lo[0], lo[1], hi[2]), at(hi[0], lo[1], hi[2]), t[0]);
    let c11 = lerp(at(lo[0], hi[1], hi[2]), at(hi[0], hi[1], hi[2]), t[0]);
    let c0 = lerp(c00, c10, t[1]);
    let c1 = lerp(c01, c11, t[1]);
    lerp(c0, c1, t[2])
}

/// Semi-Lagrangian backward trace of the velocity field.
pub fn advect(dims: GridDims, velocity_in: &[Vec4], velocity_out: &mut [Vec4], constants: &SimulationConstants) {
    let n = [dims.nx as f32, dims.ny as f32, dims.nz as f32];
    for (i, out) in velocity_out.iter_mut().enumerate().take(dims.cell_count()) {
        let cell = dims.coord(i);
        let v = velocity_in[i];
        let c = [cell.x as f32, cell.y as f32, cell.z as f32];
        let mut pos = [0.0f32; 3];
        for axis in 0..3 {
            let uvw = (c[axis] + 0.5) / n[axis];
            let back = uvw - v[axis] * constants.timestep * constants.vector[axis];
            pos[axis] = back * n[axis] - 0.5;
        }
        *out = sample_trilinear(dims, velocity_in, pos);
    }
}

/// `v.xyz += force * dt`, in place.
pub fn apply_forces(velocity: &mut [Vec4], constants: &SimulationConstants) {
    let dt = constants.timestep;
    for v in velocity.iter_mut() {
        v[0] += constants.vector[0] * dt;
        v[1] += constants.vector[1] * dt;
        v[2] += constants.vector[2] * dt;
    }
}

pub fn divergence_at(dims: GridDims, velocity: &[Vec4], cell: CellCoord) -> f32 {
    let right = velocity_or_zero(dims, velocity, cell, 1, 0, 0);
    let left = velocity_or_zero(dims, velocity, cell, -1, 0, 0);
    let up = velocity_or_zero(dims, velocity, cell, 0, 1, 0);
    let down = velocity_or_zero(dims, velocity, cell, 0, -1, 0);
    let front = velocity_or_zero(dims, velocity, cell, 0, 0, 1);
    let back = velocity_or_zero(dims, velocity, cell, 0, 0, -1);
    0.5 * ((right[0] - left[0]) + (up[1] - down[1]) + (front[2] - back[2]))
}

pub fn divergence(dims: GridDims, velocity: &[Vec4], out: &mut [f32]) {
    for (i, d) in out.iter_mut().enumerate().take(dims.cell_count()) {
        *d = divergence_at(dims, velocity, dims.coord(i));
    }
}

/// One relaxation sweep of `∇²p = div` with unit spacing.
pub fn jacobi(dims: GridDims, pressure_in: &[f32], divergence: &[f32], pressure_out: &mut [f32]) {
    for (i, p) in pressure_out.iter_mut().enumerate().take(dims.cell_count()) {
        let cell = dims.coord(i);
        let sum = pressure_or_zero(dims, pressure_in, cell, 1, 0, 0)
            + pressure_or_zero(dims, pressure_in, cell, -1, 0, 0)
            + pressure_or_zero(dims, pressure_in, cell, 0, 1, 0)
            + pressure_or_zero(dims, pressure_in, cell, 0, -1, 0)
            + pressure_or_zero(dims, pressure_in, cell, 0, 0, 1)
            + pressure_or_zero(dims, pressure_in, cell, 0, 0, -1);
        *p = (sum - divergence[i]) / 6.0;
    }
}

/// Subtract the central-difference pressure gradient, in place.
pub fn project(dims: GridDims, pressure: &[f32], velocity: &mut [Vec4]) {
    for (i, v) in velocity.iter_mut().enumerate().take(dims.cell_count()) {
        let cell = dims.coord(i);
        let gx = pressure_or_zero(dims, pressure, cell, 1, 0, 0) - pressure_or_zero(dims, pressure, cell, -1, 0, 0);
        let gy = pressure_or_zero(dims, pressure, cell, 0, 1, 0) - pressure_or_zero(dims, pressure, cell, 0, -1, 0);
        let gz = pressure_or_zero(dims, pressure, cell, 0, 0, 1) - pressure_or_zero(dims, pressure, cell, 0, 0, -1);
        v[0] -= 0.5 * gx;
        v[1] -= 0.5 * gy;
        v[2] -= 0.5 * gz;
    }
}

/// Runs `iterations` Jacobi sweeps, ping-ponging between the two slices. Returns the slice holding the result.
pub fn solve_pressure<'a>(
    dims: GridDims,
    mut front: &'a mut Vec<f32>,
    mut back: &'a mut Vec<f32>,
    divergence: &[f32],
    iterations: u32,
) -> &'a mut Vec<f32> {
    for _ in 0..iterations {
        jacobi(dims, front.as_slice(), divergence, back.as_mut_slice());
        std::mem::swap(&mut front, &mut back);
    }
    front
}

pub fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
