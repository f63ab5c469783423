//! Grid geometry and the double-buffered field.

use crate::backend::BufferId;

/// Invocations per workgroup on each axis. Must match `@workgroup_size` in shaders/common.wgsl.
pub const WORKGROUP_SIZE: [u32; 3] = [8, 8, 4];

/// Number of f32 lanes per vector sample (xyz + alignment padding).
pub const VECTOR_LANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDims {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
}

impl GridDims {
    pub const fn new(nx: u32, ny: u32, nz: u32) -> Self {
        Self { nx, ny, nz }
    }

    pub const fn cube(n: u32) -> Self {
        Self::new(n, n, n)
    }

    pub fn from_array(size: [u32; 3]) -> Self {
        Self::new(size[0], size[1], size[2])
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.nx, self.ny, self.nz]
    }

    pub fn cell_count(&self) -> usize {
        self.nx as usize * self.ny as usize * self.nz as usize
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }

    /// Linear index, x fastest.
    pub fn index(&self, cell: CellCoord) -> usize {
        cell.x as usize
            + cell.y as usize * self.nx as usize
            + cell.z as usize * self.nx as usize * self.ny as usize
    }

    pub fn coord(&self, index: usize) -> CellCoord {
        let nx = self.nx as usize;
        let plane = nx * self.ny as usize;
        CellCoord::new(
            (index % nx) as u32,
            ((index % plane) / nx) as u32,
            (index / plane) as u32,
        )
    }

    pub fn contains(&self, cell: CellCoord) -> bool {
        cell.x < self.nx && cell.y < self.ny && cell.z < self.nz
    }

    /// Signed neighbor lookup; `None` outside the grid.
    pub fn offset(&self, cell: CellCoord, dx: i32, dy: i32, dz: i32) -> Option<usize> {
        let x = cell.x as i64 + dx as i64;
        let y = cell.y as i64 + dy as i64;
        let z = cell.z as i64 + dz as i64;
        if x < 0 || y < 0 || z < 0 || x >= self.nx as i64 || y >= self.ny as i64 || z >= self.nz as i64 {
            return None;
        }
        Some(self.index(CellCoord::new(x as u32, y as u32, z as u32)))
    }

    pub fn center(&self) -> CellCoord {
        CellCoord::new(self.nx / 2, self.ny / 2, self.nz / 2)
    }

    /// `ceil(n / group)` per axis.
    pub fn workgroups(&self) -> WorkgroupCount {
        WorkgroupCount {
            x: self.nx.div_ceil(WORKGROUP_SIZE[0]),
            y: self.ny.div_ceil(WORKGROUP_SIZE[1]),
            z: self.nz.div_ceil(WORKGROUP_SIZE[2]),
        }
    }

    /// Advection scale: one cell per unit velocity per unit time, in normalized coordinates.
    pub fn inverse_size(&self) -> [f32; 3] {
        [1.0 / self.nx as f32, 1.0 / self.ny as f32, 1.0 / self.nz as f32]
    }

    pub fn iter(&self) -> impl Iterator<Item = CellCoord> + '_ {
        (0..self.cell_count()).map(move |i| self.coord(i))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl CellCoord {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupCount {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Inclusive-exclusive box of cells, already clamped to a grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRegion {
    pub min: CellCoord,
    pub max: CellCoord,
}

impl CellRegion {
    /// Cube of half-extent `radius` around `center`, clipped to `dims`.
    pub fn around(dims: GridDims, center: CellCoord, radius: u32) -> Self {
        let lo = |c: u32| c.saturating_sub(radius);
        let hi = |c: u32, n: u32| c.saturating_add(radius).saturating_add(1).min(n);
        Self {
            min: CellCoord::new(lo(center.x), lo(center.y), lo(center.z)),
            max: CellCoord::new(
                hi(center.x, dims.nx),
                hi(center.y, dims.ny),
                hi(center.z, dims.nz),
            ),
        }
    }

    pub fn cell_count(&self) -> usize {
        (self.max.x - self.min.x) as usize
            * (self.max.y - self.min.y) as usize
            * (self.max.z - self.min.z) as usize
    }

    /// Contiguous x-runs as (first linear index, run length).
    pub fn rows(&self, dims: GridDims) -> Vec<(usize, usize)> {
        let run = (self.max.x - self.min.x) as usize;
        let mut rows = Vec::with_capacity((self.max.y - self.min.y) as usize * (self.max.z - self.min.z) as usize);
        for z in self.min.z..self.max.z {
            for y in self.min.y..self.max.y {
                rows.push((dims.index(CellCoord::new(self.min.x, y, z)), run));
            }
        }
        rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    Scalar,
    Vector4,
}

impl SampleKind {
    pub fn lanes(&self) -> usize {
        match self {
            SampleKind::Scalar => 1,
            SampleKind::Vector4 => VECTOR_LANES,
        }
    }

    pub fn byte_size(&self) -> u64 {
        (self.lanes() * std::mem::size_of::<f32>()) as u64
    }
}

/// Two equally shaped buffers and a bit naming the authoritative one.
///
/// The handles are non-owning; storage lives in the backend owned by the controller.
#[derive(Debug, Clone)]
pub struct GridField {
    label: &'static str,
    dims: GridDims,
    kind: SampleKind,
    buffers: [BufferId; 2],
    front: bool,
}

impl GridField {
    pub fn double(label: &'static str, dims: GridDims, kind: SampleKind, a: BufferId, b: BufferId) -> Self {
        Self { label, dims, kind, buffers: [a, b], front: false }
    }

    /// Single-buffered field: both roles name the same buffer and it is never swapped.
    pub fn single(label: &'static str, dims: GridDims, kind: SampleKind, buffer: BufferId) -> Self {
        Self { label, dims, kind, buffers: [buffer, buffer], front: false }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn is_double_buffered(&self) -> bool {
        self.buffers[0] != self.buffers[1]
    }

    pub fn read(&self) -> BufferId {
        self.buffers[self.front as usize]
    }

    pub fn write(&self) -> BufferId {
        self.buffers[!self.front as usize]
    }

    pub fn swap(&mut self) {
        self.front = !self.front;
    }

    pub fn front(&self) -> bool {
        self.front
    }

    pub fn restore_front(&mut self, front: bool) {
        self.front = front;
    }

    pub fn buffers(&self) -> [BufferId; 2] {
        self.buffers
    }

    pub fn byte_size(&self) -> u64 {
        self.dims.cell_count() as u64 * self.kind.byte_size()
    }
}
