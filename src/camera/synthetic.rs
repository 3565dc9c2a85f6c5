//! Deterministic test-pattern cameras.
//!
//! A [`SyntheticBackend`] behaves like a real camera stack: it exposes device
//! nodes, answers probes (optionally slowly), refuses opens on chosen access
//! paths and produces frames at a chosen pace. Cameras can be swapped at
//! runtime to simulate unplugging and replugging hardware.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::backend::{CameraBackend, DeviceNode, FrameSource, ProbeInfo};
use super::errors::CameraError;
use super::types::{AccessPath, Capability, DriverInfo, PixelFormat, RawFrame};

/// Which kind of access path an open fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Stable,
    Os,
    Index,
}

impl AccessKind {
    pub fn of(path: &AccessPath) -> Self {
        match path {
            AccessPath::StablePath(_) => AccessKind::Stable,
            AccessPath::OsPath(_) => AccessKind::Os,
            AccessPath::Index(_) => AccessKind::Index,
        }
    }
}

/// Failure injected when opening through a given access kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFault {
    Busy,
    PermissionDenied,
    Unavailable,
}

/// How fast a synthetic stream hands out frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// One frame per `1 / fps` of the negotiated mode.
    #[default]
    Realtime,
    /// As fast as the reader asks.
    Unpaced,
    /// One frame per fixed interval.
    Fixed(Duration),
}

/// Description of one fake camera.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    index: u32,
    hardware_path: Option<PathBuf>,
    card: String,
    driver: Option<String>,
    bus: Option<String>,
    capabilities: Vec<Capability>,
    probe_delay: Option<Duration>,
    open_faults: HashMap<AccessKind, OpenFault>,
    fail_after: Option<u64>,
}

impl SyntheticCamera {
    /// A camera at OS index `index` supporting 1280x720 and 640x480 at 30fps.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            hardware_path: None,
            card: format!("Synthetic Camera {}", index),
            driver: None,
            bus: None,
            capabilities: vec![
                Capability::new(1280, 720, 30, PixelFormat::Mjpeg),
                Capability::new(640, 480, 30, PixelFormat::Yuyv),
            ],
            probe_delay: None,
            open_faults: HashMap::new(),
            fail_after: None,
        }
    }

    pub fn with_hardware_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hardware_path = Some(path.into());
        self
    }

    pub fn with_card(mut self, card: impl Into<String>) -> Self {
        self.card = card.into();
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>, bus: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self.bus = Some(bus.into());
        self
    }

    /// Replace the advertised modes.
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Block probes for `delay` before answering.
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn with_open_fault(mut self, kind: AccessKind, fault: OpenFault) -> Self {
        self.open_faults.insert(kind, fault);
        self
    }

    /// Break the stream after `frames` frames have been read.
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn os_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/video{}", self.index))
    }

    fn matches(&self, path: &AccessPath) -> bool {
        match path {
            AccessPath::StablePath(p) => self.hardware_path.as_ref() == Some(p),
            AccessPath::OsPath(p) => *p == self.os_path(),
            AccessPath::Index(i) => *i == self.index,
        }
    }
}

/// In-memory camera stack.
#[derive(Debug, Default)]
pub struct SyntheticBackend {
    cameras: Mutex<Vec<SyntheticCamera>>,
    pacing: Pacing,
    attempts: Mutex<Vec<AccessPath>>,
}

impl SyntheticBackend {
    pub fn new(cameras: Vec<SyntheticCamera>) -> Self {
        Self {
            cameras: Mutex::new(cameras),
            pacing: Pacing::default(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Two cameras with hardware-linked paths, ready for a dual recording.
    pub fn pair() -> Self {
        Self::new(vec![
            SyntheticCamera::new(0).with_hardware_path("/dev/v4l/by-id/usb-Synthetic_Cam_A-video-index0"),
            SyntheticCamera::new(2).with_hardware_path("/dev/v4l/by-id/usb-Synthetic_Cam_B-video-index0"),
        ])
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Replace the connected cameras, as if hardware was unplugged and replugged.
    pub fn set_cameras(&self, cameras: Vec<SyntheticCamera>) {
        *self.cameras.lock().unwrap_or_else(PoisonError::into_inner) = cameras;
    }

    /// Every access path an open was attempted on, in order.
    pub fn open_attempts(&self) -> Vec<AccessPath> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn find(&self, pred: impl Fn(&SyntheticCamera) -> bool) -> Option<SyntheticCamera> {
        self.cameras
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| pred(c))
            .cloned()
    }
}

impl CameraBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn scan(&self) -> Result<Vec<DeviceNode>, CameraError> {
        let cameras = self.cameras.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nodes: Vec<DeviceNode> = cameras
            .iter()
            .map(|c| DeviceNode {
                index: c.index,
                os_path: c.os_path(),
                hardware_path: c.hardware_path.clone(),
            })
            .collect();
        nodes.sort_by_key(|n| n.index);
        Ok(nodes)
    }

    fn probe(&self, node: &DeviceNode) -> Result<ProbeInfo, CameraError> {
        let camera = self
            .find(|c| c.index == node.index)
            .ok_or_else(|| CameraError::DeviceUnavailable(node.os_path.display().to_string()))?;
        if let Some(delay) = camera.probe_delay {
            thread::sleep(delay);
        }
        Ok(ProbeInfo {
            driver_info: DriverInfo {
                card: camera.card.clone(),
                driver: camera.driver.clone(),
                bus: camera.bus.clone(),
            },
            capabilities: camera.capabilities.clone(),
        })
    }

    fn open(
        &self,
        path: &AccessPath,
        mode: &Capability,
    ) -> Result<Box<dyn FrameSource>, CameraError> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.clone());

        let name = path.device_path().display().to_string();
        let camera = self
            .find(|c| c.matches(path))
            .ok_or_else(|| CameraError::DeviceUnavailable(name.clone()))?;

        match camera.open_faults.get(&AccessKind::of(path)) {
            Some(OpenFault::Busy) => return Err(CameraError::DeviceBusy(name)),
            Some(OpenFault::PermissionDenied) => return Err(CameraError::PermissionDenied(name)),
            Some(OpenFault::Unavailable) => return Err(CameraError::DeviceUnavailable(name)),
            None => {}
        }

        let interval = match self.pacing {
            Pacing::Realtime => Some(Duration::from_secs_f64(1.0 / mode.fps.max(1) as f64)),
            Pacing::Fixed(d) => Some(d),
            Pacing::Unpaced => None,
        };

        Ok(Box::new(SyntheticSource {
            seed: camera.index as u8,
            mode: mode.clone(),
            frames_read: 0,
            fail_after: camera.fail_after,
            interval,
            next_due: Instant::now(),
        }))
    }
}

/// A running synthetic stream.
#[derive(Debug)]
pub struct SyntheticSource {
    seed: u8,
    mode: Capability,
    frames_read: u64,
    fail_after: Option<u64>,
    interval: Option<Duration>,
    next_due: Instant,
}

/// Frame counter embedded in the first 8 bytes of a synthetic frame.
pub fn frame_counter(pixels: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = pixels.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
        if self.fail_after.is_some_and(|n| self.frames_read >= n) {
            return Err(CameraError::StreamFailed(format!(
                "synthetic camera {} disconnected after {} frames",
                self.seed, self.frames_read
            )));
        }

        if let Some(interval) = self.interval {
            let now = Instant::now();
            if self.next_due > now {
                thread::sleep(self.next_due - now);
                self.next_due += interval;
            } else {
                self.next_due = now + interval;
            }
        }

        let res = self.mode.resolution;
        let fill = self.seed.wrapping_mul(40).wrapping_add(self.frames_read as u8);
        let mut data = vec![fill; res.rgb_frame_len()];
        let counter = self.frames_read.to_le_bytes();
        let n = counter.len().min(data.len());
        data[..n].copy_from_slice(&counter[..n]);

        self.frames_read += 1;
        Ok(RawFrame {
            width: res.width,
            height: res.height,
            data,
        })
    }

    fn mode(&self) -> &Capability {
        &self.mode
    }
}
