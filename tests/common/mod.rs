//! Helpers shared by the end-to-end tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dualcam_recorder::camera::synthetic::{Pacing, SyntheticCamera};
use dualcam_recorder::camera::{
    CameraBackend, CameraHandle, Capability, DeviceOpener, DeviceRegistry, PixelFormat,
    SyntheticBackend,
};
use dualcam_recorder::recording::SessionOptions;

pub const CAM_A: &str = "/dev/v4l/by-id/usb-Synthetic_Cam_A-video-index0";
pub const CAM_B: &str = "/dev/v4l/by-id/usb-Synthetic_Cam_B-video-index0";

/// Small frames keep disk and checksum work low.
pub fn small_mode() -> Capability {
    Capability::new(320, 240, 30, PixelFormat::Yuyv)
}

pub fn small_camera(index: u32, hardware_path: &str) -> SyntheticCamera {
    SyntheticCamera::new(index)
        .with_hardware_path(hardware_path)
        .with_capabilities(vec![small_mode()])
}

/// Two small cameras producing a frame every `interval`.
pub fn small_pair(interval: Duration) -> Arc<SyntheticBackend> {
    Arc::new(
        SyntheticBackend::new(vec![small_camera(0, CAM_A), small_camera(2, CAM_B)])
            .with_pacing(Pacing::Fixed(interval)),
    )
}

/// Detect and open the first two cameras of `backend`.
pub fn open_pair(backend: Arc<dyn CameraBackend>, requested: &Capability) -> [CameraHandle; 2] {
    let detection = DeviceRegistry::new(Arc::clone(&backend))
        .detect_cameras()
        .expect("detection");
    let [first, second] = detection.select_pair().expect("two cameras");
    let opener = DeviceOpener::new(backend);
    [
        opener.open_with_fallback(&first, requested).expect("open first"),
        opener.open_with_fallback(&second, requested).expect("open second"),
    ]
}

pub fn options(output_root: &Path, queue_capacity: usize) -> SessionOptions {
    SessionOptions {
        queue_capacity,
        ..SessionOptions::default().with_output_root(output_root)
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
