//! Error types for device detection and opening.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur while detecting or opening cameras.
///
/// Every variant names a specific cause so a caller can decide between
/// retrying (`DeviceBusy`, `ProbeTimeout`) and asking for intervention.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    /// Detection finished without a single responsive camera
    #[error("No cameras found. Make sure the cameras are connected and run 'dualcam list-cameras'")]
    NoDevicesFound,

    /// Fewer cameras than a dual recording needs
    #[error("Found {found} camera(s), but dual recording needs 2. Connect another camera and retry")]
    InsufficientDevices { found: usize },

    /// A device did not answer its probe in time; it is skipped for this pass
    #[error("Probing {} timed out after {:?}; the device was skipped", path.display(), timeout)]
    ProbeTimeout { path: PathBuf, timeout: Duration },

    /// The device is held by another process or another handle
    #[error("Camera {0} is busy (opened by another process or handle). Close it and retry")]
    DeviceBusy(String),

    /// The OS refused access to the device node
    #[error("Permission denied opening {0}. Add your user to the 'video' group or fix the device permissions")]
    PermissionDenied(String),

    /// None of the access candidates could be opened
    #[error("Camera {0} is unavailable: no access path could be opened. Run 'dualcam list-cameras' to re-detect")]
    DeviceUnavailable(String),

    /// Enumeration or probing failed
    #[error("Failed to query cameras: {0}")]
    QueryFailed(String),

    /// The capture stream broke
    #[error("Camera stream failed: {0}")]
    StreamFailed(String),

    /// ffmpeg is needed to stream from v4l2 devices
    #[error("FFmpeg not found. Please install it with:\n\n    sudo apt install ffmpeg\n")]
    FfmpegNotFound,
}

impl CameraError {
    /// Whether the same call may succeed if simply repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CameraError::DeviceBusy(_) | CameraError::ProbeTimeout { .. }
        )
    }
}
