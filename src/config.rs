//! Configuration file handling for dualcam-recorder.
//!
//! Loads configuration from `~/.config/dualcam-recorder/config.toml` or a custom path.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{Capability, PixelFormat, Rotation};
use crate::preview::PreviewOptions;
use crate::recording::SessionOptions;

/// Configuration file structure for dualcam-recorder.
/// Loaded from ~/.config/dualcam-recorder/config.toml (or custom path via --config).
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DevicesConfig {
    /// Time a device gets to answer its capability probe
    pub probe_timeout_ms: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Driver fourcc, e.g. "MJPG" or "YUYV"
    pub pixel_format: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            pixel_format: "MJPG".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RecordingConfig {
    /// Parent directory of session directories; `~` is expanded
    pub output_dir: String,
    pub queue_capacity: usize,
    pub memory_ceiling_mb: usize,
    /// Per camera, in degrees clockwise
    pub rotation: [Rotation; 2],
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: "~/Videos".to_string(),
            queue_capacity: 256,
            memory_ceiling_mb: 1024,
            rotation: [Rotation::None; 2],
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PreviewConfig {
    pub fps: u32,
    pub staleness_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            staleness_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    /// Export every Nth frame
    pub interval: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { interval: 30 }
    }
}

impl Config {
    /// Load configuration from a file path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_path);

        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
                path: path.clone(),
                source: e,
            })?;
            let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.clone(),
                source: e,
            })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.devices.probe_timeout_ms)
    }

    /// Mode to request when opening cameras.
    pub fn requested_capability(&self) -> Capability {
        Capability::new(
            self.capture.width,
            self.capture.height,
            self.capture.fps,
            PixelFormat::from_fourcc(&self.capture.pixel_format),
        )
    }

    pub fn output_dir(&self) -> PathBuf {
        expand_tilde(&self.recording.output_dir)
    }

    /// Session settings derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            output_root: self.output_dir(),
            queue_capacity: self.recording.queue_capacity.max(1),
            memory_ceiling: self.recording.memory_ceiling_mb.saturating_mul(1024 * 1024),
            rotations: self.recording.rotation,
            preview: PreviewOptions::from_rate(
                self.preview.fps,
                Duration::from_millis(self.preview.staleness_ms),
            ),
            ..SessionOptions::default()
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError { path, source } => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
        }
    }
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("dualcam-recorder").join("config.toml"))
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config/dualcam-recorder/config.toml")
        })
}

/// Commented default configuration written by `dualcam config init`.
pub const DEFAULT_CONFIG: &str = r#"# dualcam-recorder configuration

[devices]
# How long each camera may take to report its capabilities
probe_timeout_ms = 3000

[capture]
# Requested mode; the closest supported mode is used
width = 1280
height = 720
fps = 30
# Driver pixel format: MJPG, YUYV, NV12
pixel_format = "MJPG"

[recording]
# Each session gets its own sub-directory here
output_dir = "~/Videos"
# Frames buffered per camera before capture waits for the disk
queue_capacity = 256
# Buffered megabytes per camera before the session fails
memory_ceiling_mb = 1024
# Clockwise rotation per camera: 0, 90, 180 or 270
rotation = [0, 0]

[preview]
fps = 30
# Show "no signal" when a camera's newest frame is older than this
staleness_ms = 500

[export]
# Export every Nth frame
interval = 30
"#;
