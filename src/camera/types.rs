//! Camera types and data structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

/// Logical camera slot within a dual-camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u8);

impl CameraId {
    pub const FIRST: CameraId = CameraId(1);
    pub const SECOND: CameraId = CameraId(2);

    /// Both slots of a dual-camera rig, in order.
    pub const PAIR: [CameraId; 2] = [CameraId::FIRST, CameraId::SECOND];
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "camera{}", self.0)
    }
}

/// Where a [`StableId`] came from, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// A hardware-linked path (e.g. `/dev/v4l/by-id/...`), durable across replug.
    HardwarePath,
    /// Driver name plus bus descriptor; stable while the port doesn't change.
    DriverBus,
    /// OS enumeration index; may change on replug.
    OsIndex,
}

/// Logical identity of a physical camera.
///
/// Compared by value; never compare raw device paths to decide whether two
/// detections refer to the same hardware.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    /// Identity from a hardware-linked path. Only the link name is used, so the
    /// identity is independent of the node it currently resolves to.
    pub fn from_hardware_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self(format!("by-id:{}", name))
    }

    pub fn from_driver_bus(driver: &str, bus: &str) -> Self {
        Self(format!("bus:{}@{}", driver, bus))
    }

    pub fn from_index(index: u32) -> Self {
        Self(format!("index:{}", index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One concrete way to reach a device, tried in order by the opener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessPath {
    /// Hardware-linked path.
    StablePath(PathBuf),
    /// OS device node such as `/dev/video2`.
    OsPath(PathBuf),
    /// Numeric OS index.
    Index(u32),
}

impl AccessPath {
    /// Device node this access path refers to.
    pub fn device_path(&self) -> PathBuf {
        match self {
            AccessPath::StablePath(p) | AccessPath::OsPath(p) => p.clone(),
            AccessPath::Index(i) => PathBuf::from(format!("/dev/video{}", i)),
        }
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessPath::StablePath(p) => write!(f, "stable path {}", p.display()),
            AccessPath::OsPath(p) => write!(f, "os path {}", p.display()),
            AccessPath::Index(i) => write!(f, "index {}", i),
        }
    }
}

/// Camera resolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// 640x480
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    /// 1280x720
    pub const HD: Resolution = Resolution {
        width: 1280,
        height: 720,
    };

    /// 1920x1080
    pub const FULL_HD: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether this resolution fits inside `other` in both dimensions.
    pub fn fits_within(&self, other: &Resolution) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    /// Size of one RGB24 frame at this resolution.
    pub fn rgb_frame_len(&self) -> usize {
        self.checked_rgb_frame_len().unwrap_or(usize::MAX)
    }

    /// Like `rgb_frame_len`, but `None` when the size does not fit in memory.
    pub fn checked_rgb_frame_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(3)
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::HD
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    /// Parse `WIDTHxHEIGHT`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s.split_once('x').ok_or_else(|| {
            format!(
                "Invalid resolution format '{}'. Use WIDTHxHEIGHT (e.g., 1280x720)",
                s
            )
        })?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid width '{}' in resolution", w))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid height '{}' in resolution", h))?;
        if width == 0 || height == 0 {
            return Err("Resolution width and height must be greater than 0".to_string());
        }
        Ok(Self { width, height })
    }
}

/// Pixel format reported by the driver, keyed by its fourcc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
    Nv12,
    Rgb24,
    Other(String),
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: &str) -> Self {
        match fourcc.trim().to_ascii_uppercase().as_str() {
            "MJPG" => PixelFormat::Mjpeg,
            "YUYV" => PixelFormat::Yuyv,
            "NV12" => PixelFormat::Nv12,
            "RGB3" => PixelFormat::Rgb24,
            other => PixelFormat::Other(other.to_string()),
        }
    }

    pub fn fourcc(&self) -> &str {
        match self {
            PixelFormat::Mjpeg => "MJPG",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Rgb24 => "RGB3",
            PixelFormat::Other(s) => s,
        }
    }

    /// Name ffmpeg's v4l2 demuxer uses for `-input_format`.
    pub fn ffmpeg_input_format(&self) -> Option<&'static str> {
        match self {
            PixelFormat::Mjpeg => Some("mjpeg"),
            PixelFormat::Yuyv => Some("yuyv422"),
            PixelFormat::Nv12 => Some("nv12"),
            PixelFormat::Rgb24 => Some("rgb24"),
            PixelFormat::Other(_) => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fourcc())
    }
}

/// One discrete (resolution, frame-rate, pixel-format) mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Capability {
    pub resolution: Resolution,
    pub fps: u32,
    pub pixel_format: PixelFormat,
}

impl Capability {
    pub fn new(width: u32, height: u32, fps: u32, pixel_format: PixelFormat) -> Self {
        Self {
            resolution: Resolution::new(width, height),
            fps,
            pixel_format,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{}fps {}", self.resolution, self.fps, self.pixel_format)
    }
}

/// Driver-reported identification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Card name (human readable)
    pub card: String,
    /// Kernel driver name, e.g. `uvcvideo`
    pub driver: Option<String>,
    /// Bus descriptor, e.g. `usb-0000:00:14.0-1`
    pub bus: Option<String>,
}

/// A detected camera.
///
/// Created fresh on every detection pass and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraDevice {
    pub stable_id: StableId,
    pub identity: IdentitySource,
    /// OS index at the time of detection
    pub os_index: u32,
    /// Paths to try when opening, most stable first
    pub access_candidates: Vec<AccessPath>,
    pub capabilities: BTreeSet<Capability>,
    pub driver_info: DriverInfo,
}

impl CameraDevice {
    /// False when the identity is only the OS index and may not survive a replug.
    pub fn is_stable(&self) -> bool {
        self.identity != IdentitySource::OsIndex
    }

    pub fn name(&self) -> &str {
        &self.driver_info.card
    }

    /// Modes sorted largest first, then by frame rate.
    pub fn best_modes(&self, n: usize) -> Vec<&Capability> {
        let mut modes: Vec<&Capability> = self.capabilities.iter().collect();
        modes.sort_by(|a, b| {
            b.resolution
                .area()
                .cmp(&a.resolution.area())
                .then(b.fps.cmp(&a.fps))
        });
        modes.truncate(n);
        modes
    }
}

impl fmt::Display for CameraDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] -> /dev/video{}",
            self.name(),
            self.stable_id,
            self.os_index
        )?;
        if !self.is_stable() {
            write!(f, " (unstable identity)")?;
        }
        Ok(())
    }
}

/// RGB24 pixels straight from a frame source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// A stamped frame travelling from a capture worker to its consumers.
///
/// The pixel buffer is immutable and reference counted, so the preview and
/// recording queues each hold their own reference without sharing mutable state.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub camera_id: CameraId,
    /// Restarts at 0 when recording begins
    pub sequence_number: u64,
    /// Monotonic clock sample taken at acquisition
    pub capture_timestamp: Instant,
    pub width: u32,
    pub height: u32,
    pub pixel_buffer: Arc<[u8]>,
}

impl CaptureFrame {
    pub fn from_raw(
        camera_id: CameraId,
        sequence_number: u64,
        capture_timestamp: Instant,
        raw: RawFrame,
    ) -> Self {
        Self {
            camera_id,
            sequence_number,
            capture_timestamp,
            width: raw.width,
            height: raw.height,
            pixel_buffer: Arc::from(raw.data),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_buffer.len()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// Clockwise rotation applied to a camera's images on export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(format!(
                "Rotation must be 0, 90, 180 or 270 degrees, got {}",
                other
            )),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(r: Rotation) -> Self {
        r.degrees()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(identity: IdentitySource) -> CameraDevice {
        CameraDevice {
            stable_id: StableId::from_index(3),
            identity,
            os_index: 3,
            access_candidates: vec![AccessPath::Index(3)],
            capabilities: [
                Capability::new(640, 480, 30, PixelFormat::Yuyv),
                Capability::new(1920, 1080, 30, PixelFormat::Mjpeg),
                Capability::new(1280, 720, 60, PixelFormat::Mjpeg),
                Capability::new(1280, 720, 30, PixelFormat::Mjpeg),
            ]
            .into_iter()
            .collect(),
            driver_info: DriverInfo {
                card: "Test Camera".to_string(),
                driver: None,
                bus: None,
            },
        }
    }

    #[test]
    fn test_stable_id_from_hardware_path_uses_link_name() {
        let a = StableId::from_hardware_path(Path::new(
            "/dev/v4l/by-id/usb-Logitech_C920_ABC-video-index0",
        ));
        assert_eq!(a.as_str(), "by-id:usb-Logitech_C920_ABC-video-index0");
    }

    #[test]
    fn test_stable_id_variants_are_distinct() {
        assert_ne!(
            StableId::from_driver_bus("uvcvideo", "usb-1"),
            StableId::from_index(1)
        );
        assert_eq!(StableId::from_index(4).to_string(), "index:4");
    }

    #[test]
    fn test_access_path_index_maps_to_device_node() {
        assert_eq!(
            AccessPath::Index(2).device_path(),
            PathBuf::from("/dev/video2")
        );
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("1280x720".parse::<Resolution>().unwrap(), Resolution::HD);
        assert!("1280".parse::<Resolution>().is_err());
        assert!("0x720".parse::<Resolution>().is_err());
        assert!("abcx720".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_fits_within() {
        assert!(Resolution::VGA.fits_within(&Resolution::HD));
        assert!(!Resolution::FULL_HD.fits_within(&Resolution::HD));
        assert!(!Resolution::new(1280, 800).fits_within(&Resolution::HD));
    }

    #[test]
    fn test_frame_len_overflow() {
        assert_eq!(Resolution::HD.checked_rgb_frame_len(), Some(1280 * 720 * 3));
        let huge = Resolution::new(u32::MAX, u32::MAX);
        assert_eq!(huge.checked_rgb_frame_len(), None);
        assert_eq!(huge.rgb_frame_len(), usize::MAX);
    }

    #[test]
    fn test_pixel_format_fourcc() {
        assert_eq!(PixelFormat::from_fourcc("MJPG"), PixelFormat::Mjpeg);
        assert_eq!(PixelFormat::from_fourcc("yuyv"), PixelFormat::Yuyv);
        assert_eq!(
            PixelFormat::from_fourcc("H264"),
            PixelFormat::Other("H264".to_string())
        );
        assert_eq!(PixelFormat::Yuyv.ffmpeg_input_format(), Some("yuyv422"));
        assert_eq!(PixelFormat::Other("H264".into()).ffmpeg_input_format(), None);
    }

    #[test]
    fn test_best_modes_sorted_by_area_then_fps() {
        let dev = device(IdentitySource::HardwarePath);
        let modes = dev.best_modes(3);
        assert_eq!(modes[0].resolution, Resolution::FULL_HD);
        assert_eq!(modes[1].resolution, Resolution::HD);
        assert_eq!(modes[1].fps, 60);
        assert_eq!(modes[2].fps, 30);
    }

    #[test]
    fn test_device_display_marks_unstable() {
        let stable = device(IdentitySource::DriverBus);
        let unstable = device(IdentitySource::OsIndex);
        assert!(!format!("{}", stable).contains("unstable"));
        assert!(format!("{}", unstable).contains("unstable"));
    }

    #[test]
    fn test_rotation_serde_as_degrees() {
        let json = serde_json::to_string(&Rotation::Cw270).unwrap();
        assert_eq!(json, "270");
        let back: Rotation = serde_json::from_str("90").unwrap();
        assert_eq!(back, Rotation::Cw90);
        assert!(serde_json::from_str::<Rotation>("45").is_err());
    }

    #[test]
    fn test_camera_id_display() {
        assert_eq!(CameraId::FIRST.to_string(), "camera1");
        assert_eq!(CameraId::SECOND.to_string(), "camera2");
    }
}
