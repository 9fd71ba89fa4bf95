// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional. A missing file or a parse error falls back to
// defaults with a warning.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub descriptors: DescriptorConfig,
    pub frames: FrameConfig,
    pub camera: CameraConfig,
    pub debug: DebugConfig,
}

/// Which GPU backend the demo drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
    Vulkan,
}

/// Device settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// "software" or "vulkan"
    pub backend: String,
    pub app_name: String,
    pub validation_layers: bool,
    /// Simulated per-submission latency of the software backend
    pub execution_delay_us: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: "software".to_string(),
            app_name: "render-core".to_string(),
            validation_layers: cfg!(debug_assertions),
            execution_delay_us: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DescriptorConfig {
    pub capacity: u32,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Frame loop settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub frames_in_flight: usize,
    /// Frames the demo renders before exiting
    pub frame_count: u64,
    pub width: u32,
    pub height: u32,
    /// Initial instance buffer size per frame, grows on demand
    pub instance_capacity: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            frame_count: 600,
            width: 1280,
            height: 720,
            instance_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_y_degrees: 60.0,
            near: 0.1,
            far: 500.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "render_core.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the backend as an enum
    pub fn backend_kind(&self) -> BackendKind {
        match self.device.backend.to_lowercase().as_str() {
            "software" | "soft" | "cpu" => BackendKind::Software,
            "vulkan" | "vk" => BackendKind::Vulkan,
            _ => {
                log::warn!(
                    "Unknown backend '{}', defaulting to software",
                    self.device.backend
                );
                BackendKind::Software
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.descriptors.capacity, 1024);
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.backend_kind(), BackendKind::Software);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [device]
            backend = "Vulkan"

            [frames]
            frames_in_flight = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.backend_kind(), BackendKind::Vulkan);
        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.frames.width, 1280);
        assert_eq!(config.device.app_name, "render-core");
    }

    #[test]
    fn unknown_backend_falls_back_to_software() {
        let config = Config::parse("[device]\nbackend = \"metal\"\n").unwrap();
        assert_eq!(config.backend_kind(), BackendKind::Software);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[frames]\nframes_in_flight = \"two\"\n").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.camera.fov_y_degrees, 60.0);
    }
}
