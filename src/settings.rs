use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::grid::GridDims;

pub const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

/// Frame-time clamp used when `use_frame_time` is set.
pub const MIN_FRAME_TIMESTEP: f32 = 1.0 / 240.0;
pub const MAX_FRAME_TIMESTEP: f32 = 1.0 / 30.0;

/// Per-axis cap; a 128³ vec4 field stays within the default storage binding limit.
pub const MAX_GRID_AXIS: u32 = 128;

/// Initialization-time configuration. Changing grid or solver fields requires a new controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FluidSettings {
    pub grid_size: [u32; 3],
    pub timestep: f32,
    pub use_frame_time: bool,
    pub force: [f32; 3],
    pub jacobi_iterations: u32,
    pub warm_start_pressure: bool,
    pub initial_velocity: [f32; 4],
    pub injection_velocity: [f32; 4],
    pub injection_radius: u32,
    /// Viewer color scale for velocity, pressure, divergence.
    pub view_scale: [f32; 3],
}

impl Default for FluidSettings {
    fn default() -> Self {
        Self {
            grid_size: [32, 32, 32],
            timestep: 0.1,
            use_frame_time: false,
            force: [0.0, -9.8, 0.0],
            jacobi_iterations: 40,
            warm_start_pressure: true,
            initial_velocity: [1.0, 0.0, 0.0, 1.0],
            injection_velocity: [0.0, 100.0, 0.0, 1.0],
            injection_radius: 0,
            view_scale: [0.1, 0.5, 2.0],
        }
    }
}

impl FluidSettings {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&data)?;
        Ok(settings)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        for n in self.grid_size.iter_mut() {
            *n = (*n).clamp(1, MAX_GRID_AXIS);
        }
        if !self.timestep.is_finite() {
            self.timestep = 0.1;
        }
        self.timestep = self.timestep.clamp(1.0e-4, 1.0);
        for f in self.force.iter_mut() {
            if !f.is_finite() {
                *f = 0.0;
            }
            *f = f.clamp(-1000.0, 1000.0);
        }
        self.jacobi_iterations = self.jacobi_iterations.min(1000);
        for v in self.initial_velocity.iter_mut().chain(self.injection_velocity.iter_mut()) {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        self.injection_radius = self.injection_radius.min(64);
        for s in self.view_scale.iter_mut() {
            *s = s.clamp(1.0e-4, 1000.0);
        }
    }

    pub fn dims(&self) -> GridDims {
        GridDims::from_array(self.grid_size)
    }

    /// Timestep for a tick that follows `elapsed` seconds of wall time.
    pub fn timestep_for(&self, elapsed: f32) -> f32 {
        if self.use_frame_time && elapsed.is_finite() {
            elapsed.clamp(MIN_FRAME_TIMESTEP, MAX_FRAME_TIMESTEP)
        } else {
            self.timestep
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_json_round_trip() {
        let dir = std::env::temp_dir().join(format!("gridflow-settings-{}", std::process::id()));
        let path = dir.join(SETTINGS_FILE_NAME);
        let mut settings = FluidSettings::default();
        settings.jacobi_iterations = 12;
        settings.save_to_disk(&path).unwrap();
        let loaded = FluidSettings::load_from_disk(&path).unwrap();
        assert_eq!(loaded, settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: FluidSettings = serde_json::from_str(r#"{"jacobi_iterations": 7}"#).unwrap();
        assert_eq!(settings.jacobi_iterations, 7);
        assert_eq!(settings.grid_size, [32, 32, 32]);
        assert!(settings.warm_start_pressure);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut settings = FluidSettings {
            grid_size: [0, 4096, 16],
            timestep: f32::NAN,
            force: [f32::INFINITY, -5000.0, 1.0],
            jacobi_iterations: 1_000_000,
            ..Default::default()
        };
        settings.sanitize();
        assert_eq!(settings.grid_size, [1, MAX_GRID_AXIS, 16]);
        assert_eq!(settings.timestep, 0.1);
        assert_eq!(settings.force, [0.0, -1000.0, 1.0]);
        assert_eq!(settings.jacobi_iterations, 1000);
    }

    #[test]
    fn frame_time_is_clamped_only_when_enabled() {
        let mut settings = FluidSettings::default();
        assert_eq!(settings.timestep_for(5.0), 0.1);
        settings.use_frame_time = true;
        assert_eq!(settings.timestep_for(5.0), MAX_FRAME_TIMESTEP);
        assert_eq!(settings.timestep_for(0.0), MIN_FRAME_TIMESTEP);
        assert_eq!(settings.timestep_for(0.02), 0.02);
    }

    #[test]
    fn non_finite_frame_time_falls_back_to_fixed_timestep() {
        let settings = FluidSettings { use_frame_time: true, ..Default::default() };
        assert_eq!(settings.timestep_for(f32::NAN), 0.1);
        assert_eq!(settings.timestep_for(f32::INFINITY), 0.1);
    }

    #[test]
    fn largest_sanitized_grid_fits_default_binding_limit() {
        let mut settings = FluidSettings { grid_size: [u32::MAX; 3], ..Default::default() };
        settings.sanitize();
        let field_bytes = settings.dims().cell_count() as u64 * crate::grid::SampleKind::Vector4.byte_size();
        assert!(field_bytes <= u64::from(wgpu::Limits::default().max_storage_buffer_binding_size));
    }
}
