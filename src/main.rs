// Interactive viewer: runs the simulation on the GPU and shows one z-slice.
// Run with: cargo run --release

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use gridflow::backend::BufferId;
use gridflow::params::ViewParams;
use gridflow::{
    CellCoord, FieldSelector, FluidSettings, FrontView, InjectionRequest, InjectionTarget, SetupError, SimulationController,
    WgpuBackend,
};
use wgpu::util::DeviceExt;
use winit::{
    event::*,
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
};

const VIEW_MODES: [&str; 3] = ["velocity", "pressure", "divergence"];
/// Ticks between background divergence readbacks.
const READBACK_INTERVAL: u64 = 120;

type FrontKey = (BufferId, BufferId, BufferId);

struct FluidViewer {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,

    controller: SimulationController<WgpuBackend>,
    settings_path: PathBuf,

    render_pipeline: wgpu::RenderPipeline,
    render_bind_group_layout: wgpu::BindGroupLayout,
    render_bind_groups: HashMap<FrontKey, wgpu::BindGroup>,
    view_params_buffer: wgpu::Buffer,

    render_mode: u32,
    slice: u32,

    // Performance tracking
    frame_count: u32,
    frame_time_sum: f32,
    last_fps_update: std::time::Instant,
}

impl FluidViewer {
    async fn new(
        window: Arc<winit::window::Window>,
        settings: FluidSettings,
        settings_path: PathBuf,
    ) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance.create_surface(window.clone())?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(SetupError::NoAdapter)?;
        log::info!("Using adapter {:?}", adapter.get_info());

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
            .await?;
        let device = Arc::new(device);
        let queue = Arc::new(queue);

        let backend = WgpuBackend::new(device.clone(), queue.clone());
        let controller = SimulationController::new(backend, &settings).map_err(|e| {
            log::error!("Simulation setup failed: {e}");
            e
        })?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| anyhow::anyhow!("surface reports no formats"))?;
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let render_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume View Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../shaders/volume_view.wgsl").into()),
        });

        let storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let render_bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Render Bind Group Layout"),
            entries: &[
                storage_entry(0),
                storage_entry(1),
                storage_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let dims = controller.dims();
        let slice = dims.nz / 2;
        let view_params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("View Params"),
            contents: bytemuck::bytes_of(&view_params(&settings, dims.as_array(), slice, 0)),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let render_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Render Pipeline Layout"),
            bind_group_layouts: &[&render_bind_group_layout],
            push_constant_ranges: &[],
        });
        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Render Pipeline"),
            layout: Some(&render_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &render_shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &render_shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: surface_config.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        Ok(Self {
            device,
            queue,
            surface,
            surface_config,
            controller,
            settings_path,
            render_pipeline,
            render_bind_group_layout,
            render_bind_groups: HashMap::new(),
            view_params_buffer,
            render_mode: 0,
            slice,
            frame_count: 0,
            frame_time_sum: 0.0,
            last_fps_update: std::time::Instant::now(),
        })
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.surface_config.width = width;
            self.surface_config.height = height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    fn set_render_mode(&mut self, mode: u32) {
        self.render_mode = mode;
    }

    fn step_slice(&mut self, delta: i32) {
        let nz = self.controller.dims().nz as i32;
        self.slice = (self.slice as i32 + delta).clamp(0, nz - 1) as u32;
    }

    fn inject(&mut self, target: InjectionTarget) {
        let settings = self.controller.settings();
        let request = InjectionRequest { target, value: settings.injection_velocity, radius: settings.injection_radius };
        if let Err(e) = self.controller.request_injection(request) {
            log::warn!("{e}");
        }
    }

    /// Cursor in physical pixels to a cell on the visible slice.
    fn cursor_cell(&self, cursor: (f32, f32)) -> CellCoord {
        let dims = self.controller.dims();
        let w = self.surface_config.width.max(1) as f32;
        let h = self.surface_config.height.max(1) as f32;
        let gx = ((cursor.0 / w) * dims.nx as f32).clamp(0.0, (dims.nx - 1) as f32) as u32;
        let gy = ((1.0 - cursor.1 / h) * dims.ny as f32).clamp(0.0, (dims.ny - 1) as f32) as u32;
        CellCoord::new(gx, gy, self.slice)
    }

    fn save_settings(&self) {
        match self.controller.settings().save_to_disk(&self.settings_path) {
            Ok(()) => log::info!("Saved settings to {}", self.settings_path.display()),
            Err(e) => log::error!("Failed to save settings: {e:?}"),
        }
    }

    fn get_fps_and_frame_time(&mut self) -> Option<(f32, f32)> {
        let elapsed = self.last_fps_update.elapsed();
        if elapsed.as_secs_f32() >= 0.5 && self.frame_count > 0 {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            let avg_frame_time_ms = (self.frame_time_sum / self.frame_count as f32) * 1000.0;
            self.frame_count = 0;
            self.frame_time_sum = 0.0;
            self.last_fps_update = std::time::Instant::now();
            return Some((fps, avg_frame_time_ms));
        }
        None
    }

    fn update_window_title(&mut self, window: &winit::window::Window) {
        if let Some((fps, frame_time_ms)) = self.get_fps_and_frame_time() {
            let dims = self.controller.dims();
            let title = format!(
                "Gridflow - {}x{}x{} | z {} | {} | {:.0} FPS | {:.2} ms/frame",
                dims.nx,
                dims.ny,
                dims.nz,
                self.slice,
                VIEW_MODES[self.render_mode as usize],
                fps,
                frame_time_ms
            );
            window.set_title(&title);
        }
    }

    fn update(&mut self, dt: f32) {
        self.frame_count += 1;
        self.frame_time_sum += dt;

        match self.controller.advance(dt) {
            Ok(report) => {
                if report.tick % READBACK_INTERVAL == 0 {
                    if let Err(e) = self.controller.request_readback(FieldSelector::Divergence) {
                        log::debug!("Divergence readback skipped: {e}");
                    }
                }
            }
            Err(e) => log::error!("Tick failed: {e}"),
        }

        match self.controller.poll_readback() {
            Ok(Some(snapshot)) => {
                log::info!("Tick {}: divergence L2 {:.4}", self.controller.tick(), snapshot.l2_norm());
            }
            Ok(None) | Err(gridflow::ReadbackError::NothingPending) => {}
            Err(e) => log::warn!("Divergence readback failed: {e}"),
        }
    }

    fn front_bind_group(&mut self, front: FrontView) -> Option<&wgpu::BindGroup> {
        let key = (front.velocity, front.pressure, front.divergence);
        if !self.render_bind_groups.contains_key(&key) {
            let backend = self.controller.backend();
            let velocity = backend.buffer(front.velocity)?;
            let pressure = backend.buffer(front.pressure)?;
            let divergence = backend.buffer(front.divergence)?;
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Render Bind Group"),
                layout: &self.render_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: velocity.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: pressure.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 2, resource: divergence.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 3, resource: self.view_params_buffer.as_entire_binding() },
                ],
            });
            self.render_bind_groups.insert(key, bind_group);
        }
        self.render_bind_groups.get(&key)
    }

    fn render(&mut self) -> Result<(), wgpu::SurfaceError> {
        let front = self.controller.front();
        let params = view_params(self.controller.settings(), front.dims.as_array(), self.slice, self.render_mode);
        self.queue.write_buffer(&self.view_params_buffer, 0, bytemuck::bytes_of(&params));

        let output = self.surface.get_current_texture()?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });

        if self.front_bind_group(front).is_none() {
            log::error!("Front buffers {front:?} are not owned by the backend");
        }
        let key = (front.velocity, front.pressure, front.divergence);
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Render Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            if let Some(bind_group) = self.render_bind_groups.get(&key) {
                render_pass.set_pipeline(&self.render_pipeline);
                render_pass.set_bind_group(0, bind_group, &[]);
                render_pass.draw(0..3, 0..1); // Full-screen triangle
            }
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();

        Ok(())
    }
}

fn view_params(settings: &FluidSettings, dims: [u32; 3], slice: u32, mode: u32) -> ViewParams {
    ViewParams {
        dims: [dims[0], dims[1], dims[2], 0],
        slice,
        mode,
        _pad: [0; 2],
        scale: [settings.view_scale[0], settings.view_scale[1], settings.view_scale[2], 0.0],
    }
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("gridflow=info")).init();

    let settings_path = FluidSettings::default_path();
    let mut settings = match FluidSettings::load_from_disk(&settings_path) {
        Ok(settings) => {
            log::info!("Loaded settings from {}", settings_path.display());
            settings
        }
        Err(e) => {
            log::info!("Using default settings ({e})");
            FluidSettings::default()
        }
    };
    settings.sanitize();

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title("Gridflow")
                .with_inner_size(winit::dpi::PhysicalSize::new(800, 800)),
        )?,
    );

    let mut viewer = pollster::block_on(FluidViewer::new(window.clone(), settings, settings_path))?;
    let mut last_update = std::time::Instant::now();
    let mut cursor_pos_px: Option<(f32, f32)> = None;

    event_loop.run(move |event, control_flow| match event {
        Event::WindowEvent { ref event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested => control_flow.exit(),
            WindowEvent::KeyboardInput {
                event: KeyEvent {
                    physical_key: PhysicalKey::Code(KeyCode::Escape),
                    ..
                },
                ..
            } => control_flow.exit(),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => match key {
                // 1 velocity, 2 pressure, 3 divergence
                KeyCode::Digit1 => viewer.set_render_mode(0),
                KeyCode::Digit2 => viewer.set_render_mode(1),
                KeyCode::Digit3 => viewer.set_render_mode(2),
                KeyCode::ArrowUp => viewer.step_slice(1),
                KeyCode::ArrowDown => viewer.step_slice(-1),
                KeyCode::Space => viewer.inject(InjectionTarget::Center),
                KeyCode::KeyS => viewer.save_settings(),
                _ => {}
            },
            WindowEvent::CursorMoved { position, .. } => {
                cursor_pos_px = Some((position.x as f32, position.y as f32));
            }
            WindowEvent::MouseInput { state: ElementState::Pressed, button: MouseButton::Left, .. } => {
                if let Some(cursor) = cursor_pos_px {
                    let cell = viewer.cursor_cell(cursor);
                    viewer.inject(InjectionTarget::Cell(cell));
                }
            }
            WindowEvent::Resized(physical_size) => {
                viewer.resize(physical_size.width, physical_size.height);
            }
            WindowEvent::RedrawRequested => {
                let now = std::time::Instant::now();
                let dt = (now - last_update).as_secs_f32();
                last_update = now;

                viewer.update(dt);
                viewer.update_window_title(&window);

                match viewer.render() {
                    Ok(_) => {}
                    Err(wgpu::SurfaceError::Lost) => {
                        viewer.surface.configure(&viewer.device, &viewer.surface_config);
                    }
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        log::error!("Surface out of memory");
                        control_flow.exit();
                    }
                    Err(e) => log::warn!("{e:?}"),
                }
            }
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;

    Ok(())
}
