//! Video4Linux device discovery.
//!
//! Nodes are enumerated from `/dev/video*`, hardware-linked names come from
//! `/dev/v4l/by-id`, and driver info / formats are read from `v4l2-ctl`.
//! Streaming goes through [`FfmpegSource`].

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::backend::{CameraBackend, DeviceNode, FrameSource, ProbeInfo};
use super::errors::CameraError;
use super::ffmpeg::FfmpegSource;
use super::types::{AccessPath, Capability, DriverInfo, PixelFormat, Resolution};

/// Suffix of the by-id link that points at a camera's main capture node.
const MAIN_NODE_SUFFIX: &str = "-video-index0";

/// Linux v4l2 backend.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    dev_dir: PathBuf,
    by_id_dir: PathBuf,
    v4l2_ctl: String,
    ffmpeg: String,
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from("/dev"),
            by_id_dir: PathBuf::from("/dev/v4l/by-id"),
            v4l2_ctl: "v4l2-ctl".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

impl V4l2Backend {
    /// Backend rooted at custom directories (useful for chroots and tests).
    pub fn with_dirs(dev_dir: PathBuf, by_id_dir: PathBuf) -> Self {
        Self {
            dev_dir,
            by_id_dir,
            ..Self::default()
        }
    }

    fn run_v4l2_ctl(&self, device: &Path, query: &str) -> Result<String, CameraError> {
        let output = Command::new(&self.v4l2_ctl)
            .args(["-d", &device.display().to_string(), query])
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CameraError::QueryFailed(
                        "v4l2-ctl not found. Install it with: sudo apt install v4l-utils"
                            .to_string(),
                    )
                } else {
                    CameraError::QueryFailed(format!("failed to run v4l2-ctl: {}", e))
                }
            })?;

        if !output.status.success() {
            return Err(CameraError::QueryFailed(format!(
                "v4l2-ctl {} on {} failed: {}",
                query,
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse the OS index out of a node name like `video12`.
pub fn parse_node_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("video")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Scan a by-id directory and map each resolved main node to its link.
pub fn scan_by_id(by_id_dir: &Path) -> HashMap<PathBuf, PathBuf> {
    let mut mapping = HashMap::new();
    let entries = match std::fs::read_dir(by_id_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("No by-id links at {}: {}", by_id_dir.display(), e);
            return mapping;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(MAIN_NODE_SUFFIX) {
            continue;
        }
        let link = entry.path();
        match std::fs::canonicalize(&link) {
            Ok(target) => {
                mapping.insert(target, link);
            }
            Err(e) => log::warn!("Could not resolve {}: {}", link.display(), e),
        }
    }
    mapping
}

/// Parse `v4l2-ctl --info` output.
///
/// Bus descriptors contain colons, so only the first `:` on a line separates
/// key from value. A card name repeated as `X: X` is collapsed to `X`.
pub fn parse_info(output: &str) -> DriverInfo {
    let mut info = DriverInfo::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "Card type" => info.card = collapse_repeated_name(value),
            "Driver name" => info.driver = Some(value.to_string()),
            "Bus info" => info.bus = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

fn collapse_repeated_name(name: &str) -> String {
    if let Some((a, b)) = name.split_once(':') {
        if a.trim() == b.trim() {
            return a.trim().to_string();
        }
    }
    name.to_string()
}

/// Parse `v4l2-ctl --list-formats-ext` output into discrete modes.
///
/// Only `Size: Discrete` entries with at least one interval are kept; stepwise
/// and continuous ranges are ignored.
pub fn parse_formats(output: &str) -> Vec<Capability> {
    let mut caps = Vec::new();
    let mut format: Option<PixelFormat> = None;
    let mut size: Option<Resolution> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.contains("]:") {
            format = parse_fourcc(trimmed).map(|f| PixelFormat::from_fourcc(&f));
            size = None;
        } else if let Some(rest) = trimmed.strip_prefix("Size: Discrete") {
            size = rest.trim().parse::<Resolution>().ok();
        } else if trimmed.starts_with("Size:") {
            size = None;
        } else if trimmed.starts_with("Interval:") {
            if let (Some(fmt), Some(res), Some(fps)) = (&format, size, parse_fps(trimmed)) {
                caps.push(Capability {
                    resolution: res,
                    fps,
                    pixel_format: fmt.clone(),
                });
            }
        }
    }
    caps
}

fn parse_fourcc(line: &str) -> Option<String> {
    let start = line.find('\'')? + 1;
    let len = line[start..].find('\'')?;
    let fourcc = &line[start..start + len];
    (!fourcc.is_empty()).then(|| fourcc.to_string())
}

/// `Interval: Discrete 0.033s (30.000 fps)` -> 30
fn parse_fps(line: &str) -> Option<u32> {
    let open = line.rfind('(')?;
    let close = line[open..].find("fps)")? + open;
    let value: f64 = line[open + 1..close].trim().parse().ok()?;
    (value > 0.0).then(|| value.round().max(1.0) as u32)
}

/// Classify an error from opening a device node directly.
fn classify_open_error(e: &std::io::Error, device: &str) -> CameraError {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EBUSY) {
        return CameraError::DeviceBusy(device.to_string());
    }
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device.to_string()),
        _ => CameraError::DeviceUnavailable(device.to_string()),
    }
}

impl CameraBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn scan(&self) -> Result<Vec<DeviceNode>, CameraError> {
        let entries = std::fs::read_dir(&self.dev_dir).map_err(|e| {
            CameraError::QueryFailed(format!("cannot read {}: {}", self.dev_dir.display(), e))
        })?;
        let by_id = scan_by_id(&self.by_id_dir);

        let mut nodes: Vec<DeviceNode> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let index = parse_node_index(&name)?;
                let os_path = entry.path();
                let resolved = std::fs::canonicalize(&os_path).unwrap_or_else(|_| os_path.clone());
                Some(DeviceNode {
                    index,
                    hardware_path: by_id.get(&resolved).cloned(),
                    os_path,
                })
            })
            .collect();
        nodes.sort_by_key(|n| n.index);
        Ok(nodes)
    }

    fn probe(&self, node: &DeviceNode) -> Result<ProbeInfo, CameraError> {
        let info = self.run_v4l2_ctl(&node.os_path, "--info")?;
        let formats = self.run_v4l2_ctl(&node.os_path, "--list-formats-ext")?;
        let mut driver_info = parse_info(&info);
        if driver_info.card.is_empty() {
            driver_info.card = format!("Camera {}", node.index);
        }
        Ok(ProbeInfo {
            driver_info,
            capabilities: parse_formats(&formats),
        })
    }

    fn open(
        &self,
        path: &AccessPath,
        mode: &Capability,
    ) -> Result<Box<dyn FrameSource>, CameraError> {
        let device = path.device_path();
        let device_name = device.display().to_string();

        // Surface permission and existence problems before involving ffmpeg.
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device)
            .map_err(|e| classify_open_error(&e, &device_name))?;

        let source = FfmpegSource::spawn(&self.ffmpeg, &device, mode)?;
        Ok(Box::new(source))
    }
}
