//! wgpu implementation of the compute backend.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use super::{BufferId, ComputeBackend, ReadbackPoll, ResourceState, ResourceStates};
use crate::error::{ReadbackError, SetupError, TickError};
use crate::grid::{GridDims, SampleKind, WorkgroupCount};
use crate::params::{SimulationConstants, StageUniform};
use crate::stage::{compose_shader, Access, StageBindings, StageKind};

struct FieldBuffer {
    buffer: wgpu::Buffer,
    dims: GridDims,
    kind: SampleKind,
}

struct StageProgram {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform: wgpu::Buffer,
    dims: GridDims,
}

struct PendingReadback {
    staging: wgpu::Buffer,
    receiver: mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    fields: Vec<FieldBuffer>,
    programs: HashMap<StageKind, StageProgram>,
    bind_groups: HashMap<(StageKind, Vec<BufferId>), wgpu::BindGroup>,
    states: ResourceStates,
    encoder: Option<wgpu::CommandEncoder>,
    pending_readback: Option<PendingReadback>,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            log::error!("Uncaptured wgpu error: {error}");
        }));
        Self {
            device,
            queue,
            fields: Vec::new(),
            programs: HashMap::new(),
            bind_groups: HashMap::new(),
            states: ResourceStates::default(),
            encoder: None,
            pending_readback: None,
        }
    }

    /// Device without a surface, for tests and offline runs.
    pub async fn headless() -> Result<Self, SetupError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(SetupError::NoAdapter)?;
        log::info!("Using adapter {:?}", adapter.get_info().name);
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Gridflow Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| SetupError::DeviceRequest(e.to_string()))?;
        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    pub fn buffer(&self, id: BufferId) -> Option<&wgpu::Buffer> {
        self.fields.get(id.0 as usize).map(|f| &f.buffer)
    }

    fn field(&self, id: BufferId) -> Result<&FieldBuffer, TickError> {
        self.fields.get(id.0 as usize).ok_or(TickError::UnknownBuffer(id))
    }

    /// Takes the open tick encoder, creating one if nothing is recorded yet.
    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Simulation Tick Encoder"),
            })
        })
    }

    /// Blocking copy of a whole field back to the host, outside the tick stream.
    pub fn read_buffer(&self, id: BufferId) -> Result<Vec<f32>, ReadbackError> {
        let field = self.fields.get(id.0 as usize).ok_or(ReadbackError::UnknownBuffer(id))?;
        let size = field.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Read"),
        });
        encoder.copy_buffer_to_buffer(&field.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            // Receiver outlives the map; a failed send only means nobody is waiting.
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or(ReadbackError::Disconnected)?
            .map_err(|e| ReadbackError::MapFailed(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }

    fn build_program(&self, stage: StageKind, dims: GridDims) -> StageProgram {
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(stage.label()),
            source: wgpu::ShaderSource::Wgsl(compose_shader(stage).into()),
        });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for (i, access) in stage.binding_access().iter().enumerate() {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: *access == Access::Read },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        let bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{} Bind Group Layout", stage.label())),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{} Pipeline Layout", stage.label())),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(stage.label()),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        });
        let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{} Params", stage.label())),
            contents: bytemuck::bytes_of(&StageUniform::grid_only(dims)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        StageProgram { pipeline, bind_group_layout, uniform, dims }
    }

    fn ensure_bind_group(&mut self, bindings: &StageBindings) -> Result<(StageKind, Vec<BufferId>), TickError> {
        let stage = bindings.stage();
        let ids: Vec<BufferId> = bindings.resources().into_iter().map(|(id, _)| id).collect();
        let key = (stage, ids);
        if !self.bind_groups.contains_key(&key) {
            let program = self.programs.get(&stage).ok_or(TickError::ProgramUnavailable(stage))?;
            let mut entries = vec![wgpu::BindGroupEntry {
                binding: 0,
                resource: program.uniform.as_entire_binding(),
            }];
            for (i, id) in key.1.iter().enumerate() {
                let field = self.fields.get(id.0 as usize).ok_or(TickError::UnknownBuffer(*id))?;
                entries.push(wgpu::BindGroupEntry {
                    binding: i as u32 + 1,
                    resource: field.buffer.as_entire_binding(),
                });
            }
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("{} Bind Group", stage.label())),
                layout: &program.bind_group_layout,
                entries: &entries,
            });
            if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
                return Err(TickError::BindGroupRejected { stage, message: error.to_string() });
            }
            log::debug!("Created bind group for {stage} over {:?}", key.1);
            self.bind_groups.insert(key.clone(), bind_group);
        }
        Ok(key)
    }
}

impl ComputeBackend for WgpuBackend {
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
        let size = len as u64 * std::mem::size_of::<f32>() as u64;
        let limit = u64::from(self.device.limits().max_storage_buffer_binding_size);
        if size > limit {
            return Err(SetupError::BufferCreation {
                label: label.to_string(),
                message: format!("{size} bytes exceeds the {limit} byte storage binding limit"),
            });
        }
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;

        if let Some(values) = initial.filter(|values| values.len() != len) {
            return Err(SetupError::InitialDataSize {
                label: label.to_string(),
                expected: len,
                actual: values.len(),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = match initial {
            Some(values) => self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(values),
                usage,
            }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            }),
        };
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SetupError::BufferCreation { label: label.to_string(), message: error.to_string() });
        }

        let id = BufferId(self.fields.len() as u32);
        self.fields.push(FieldBuffer { buffer, dims, kind });
        Ok(id)
    }

    fn create_program(&mut self, stage: StageKind, dims: GridDims) -> Result<(), SetupError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let program = self.build_program(stage, dims);
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            let message = error.to_string();
            return Err(match error {
                wgpu::Error::Validation { ref description, .. } if description.contains("create_shader_module") => {
                    SetupError::ShaderCompilation { stage, message }
                }
                _ => SetupError::PipelineCreation { stage, message },
            });
        }
        log::info!("Compiled {stage} program for grid {}x{}x{}", dims.nx, dims.ny, dims.nz);
        self.programs.insert(stage, program);
        Ok(())
    }

    fn has_program(&self, stage: StageKind) -> bool {
        self.programs.contains_key(&stage)
    }

    fn write_constants(&mut self, stage: StageKind, constants: &SimulationConstants) -> Result<(), TickError> {
        let program = self.programs.get(&stage).ok_or(TickError::ProgramUnavailable(stage))?;
        let uniform = StageUniform::new(program.dims, constants);
        self.queue.write_buffer(&program.uniform, 0, bytemuck::bytes_of(&uniform));
        Ok(())
    }

    fn transition(&mut self, buffer: BufferId, state: ResourceState) {
        let previous = self.states.set(buffer, state);
        // wgpu inserts the actual barriers; the declaration is checked at dispatch.
        log::trace!("{buffer:?}: {previous:?} -> {state:?}");
    }

    fn dispatch(&mut self, bindings: &StageBindings, groups: WorkgroupCount) -> Result<(), TickError> {
        let stage = bindings.stage();
        if !self.has_program(stage) {
            return Err(TickError::ProgramUnavailable(stage));
        }
        bindings.validate()?;
        for (buffer, _) in bindings.resources() {
            self.field(buffer)?;
        }
        self.states.check(bindings)?;

        let key = self.ensure_bind_group(bindings)?;
        let mut encoder = self.take_encoder();
        {
            let label = format!("{} Pass", stage.label());
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.programs[&stage].pipeline);
            pass.set_bind_group(0, &self.bind_groups[&key], &[]);
            pass.dispatch_workgroups(groups.x, groups.y, groups.z);
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn clear_field(&mut self, buffer: BufferId) -> Result<(), TickError> {
        self.field(buffer)?;
        let mut encoder = self.take_encoder();
        encoder.clear_buffer(&self.fields[buffer.0 as usize].buffer, 0, None);
        self.encoder = Some(encoder);
        Ok(())
    }

    fn upload_cells(&mut self, target: BufferId, rows: &[(usize, usize)], value: [f32; 4]) -> Result<(), TickError> {
        let field = self.field(target)?;
        debug_assert_eq!(field.kind, SampleKind::Vector4);
        let cells = field.dims.cell_count();
        if rows.iter().any(|&(start, len)| start + len > cells) {
            return Err(TickError::RegionOutOfRange(target));
        }
        let found = self.states.get(target);
        if found != Some(ResourceState::CopyDst) {
            return Err(TickError::UploadState { buffer: target, found });
        }
        let total: usize = rows.iter().map(|&(_, len)| len).sum();
        if total == 0 {
            return Ok(());
        }

        let cell_bytes = SampleKind::Vector4.byte_size();
        let contents: Vec<[f32; 4]> = vec![value; total];
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Injection Staging"),
            contents: bytemuck::cast_slice(&contents),
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let mut encoder = self.take_encoder();
        let destination = &self.fields[target.0 as usize].buffer;
        let mut offset = 0u64;
        for &(start, len) in rows {
            let size = len as u64 * cell_bytes;
            encoder.copy_buffer_to_buffer(&staging, offset, destination, start as u64 * cell_bytes, size);
            offset += size;
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn submit(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }

    fn discard(&mut self) {
        if self.encoder.take().is_some() {
            log::debug!("Discarded recorded tick commands");
        }
    }

    fn begin_readback(&mut self, source: BufferId) -> Result<(), ReadbackError> {
        if self.pending_readback.is_some() {
            return Err(ReadbackError::Busy);
        }
        let field = self.fields.get(source.0 as usize).ok_or(ReadbackError::UnknownBuffer(source))?;
        let found = self.states.get(source);
        if found != Some(ResourceState::CopySrc) {
            return Err(ReadbackError::SourceState { buffer: source, found });
        }
        let size = field.buffer.size();
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(&field.buffer, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.pending_readback = Some(PendingReadback { staging, receiver });
        Ok(())
    }

    fn poll_readback(&mut self, wait: bool) -> Result<ReadbackPoll, ReadbackError> {
        let pending = self.pending_readback.as_ref().ok_or(ReadbackError::NothingPending)?;
        self.device.poll(if wait { wgpu::Maintain::Wait } else { wgpu::Maintain::Poll });
        match pending.receiver.try_recv() {
            Err(mpsc::TryRecvError::Empty) => Ok(ReadbackPoll::Pending),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.pending_readback = None;
                Err(ReadbackError::Disconnected)
            }
            Ok(Err(e)) => {
                self.pending_readback = None;
                Err(ReadbackError::MapFailed(e.to_string()))
            }
            Ok(Ok(())) => {
                let done = self.pending_readback.take().ok_or(ReadbackError::NothingPending)?;
                let slice = done.staging.slice(..);
                let data = slice.get_mapped_range();
                let values: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
                drop(data);
                done.staging.unmap();
                Ok(ReadbackPoll::Ready(values))
            }
        }
    }
}
