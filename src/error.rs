use thiserror::Error;

use crate::backend::BufferId;
use crate::grid::{CellCoord, GridDims};
use crate::stage::StageKind;

/// Initialization failures. Construction aborts on any of these.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no compatible GPU adapter found")]
    NoAdapter,
    #[error("device request failed: {0}")]
    DeviceRequest(String),
    #[error("grid {0:?} has no cells")]
    InvalidGrid(GridDims),
    #[error("initial data for {label} has {actual} floats, expected {expected}")]
    InitialDataSize {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("failed to create buffer {label}: {message}")]
    BufferCreation { label: String, message: String },
    #[error("shader for {stage} failed to compile: {message}")]
    ShaderCompilation { stage: StageKind, message: String },
    #[error("pipeline for {stage} could not be created: {message}")]
    PipelineCreation { stage: StageKind, message: String },
}

/// Conditions that abort a tick before anything is submitted.
#[derive(Debug, Error, PartialEq)]
pub enum TickError {
    #[error("compute program for {0} is unavailable")]
    ProgramUnavailable(StageKind),
    #[error("{stage} binds {buffer:?} for both reading and writing")]
    AliasedBindings { stage: StageKind, buffer: BufferId },
    #[error("{stage} expected {buffer:?} in {expected:?} state, found {found:?}")]
    ResourceState {
        stage: StageKind,
        buffer: BufferId,
        expected: crate::backend::ResourceState,
        found: Option<crate::backend::ResourceState>,
    },
    #[error("upload into {buffer:?} requires CopyDst, found {found:?}")]
    UploadState {
        buffer: BufferId,
        found: Option<crate::backend::ResourceState>,
    },
    #[error("device rejected the {stage} bind group: {message}")]
    BindGroupRejected { stage: StageKind, message: String },
    #[error("upload rows exceed the extent of {0:?}")]
    RegionOutOfRange(BufferId),
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
}

#[derive(Debug, Error, PartialEq)]
pub enum ReadbackError {
    #[error("a readback is already in flight")]
    Busy,
    #[error("no readback was requested")]
    NothingPending,
    #[error("staging map failed: {0}")]
    MapFailed(String),
    #[error("staging channel disconnected, device may be lost")]
    Disconnected,
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("readback from {buffer:?} requires CopySrc, found {found:?}")]
    SourceState {
        buffer: BufferId,
        found: Option<crate::backend::ResourceState>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum InjectionError {
    #[error("injection target {cell:?} lies outside grid {dims:?}")]
    OutOfBounds { cell: CellCoord, dims: GridDims },
}
