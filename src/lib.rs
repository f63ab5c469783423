//! 3-D Eulerian fluid solver on wgpu compute.
//!
//! Each tick runs advection, optional injection, external forces, divergence,
//! a fixed-count Jacobi pressure solve and projection. The core is written
//! against [`backend::ComputeBackend`]; [`backend::WgpuBackend`] runs it on the
//! GPU and [`backend::HostBackend`] on the CPU.

pub mod backend;
pub mod controller;
pub mod error;
pub mod grid;
pub mod kernels;
pub mod params;
pub mod settings;
pub mod stage;

pub use backend::{BufferId, ComputeBackend, HostBackend, WgpuBackend};
pub use controller::{
    FieldSelector, FieldSnapshot, FrontView, InjectionRequest, InjectionTarget, SimulationController, TickReport,
};
pub use error::{InjectionError, ReadbackError, SetupError, TickError};
pub use grid::{CellCoord, GridDims, GridField, SampleKind};
pub use settings::FluidSettings;
pub use stage::{PressureSolveState, StageKind};
