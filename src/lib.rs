//! dualcam-recorder library crate.
//!
//! Dual-camera capture engine: stable device identities, fallback opening,
//! a capture pipeline that keeps the preview live while recording loss-free,
//! the recording session state machine, and still-image export.
//!
//! The free functions below run against the Linux v4l2 backend. Tests and
//! embedders that need another backend use [`camera::DeviceRegistry`],
//! [`camera::DeviceOpener`] and [`recording::RecordingSession`] directly.

use std::sync::{Arc, OnceLock};

pub mod camera;
pub mod cli;
pub mod config;
pub mod export;
pub mod preview;
pub mod queue;
pub mod recording;

use camera::{
    CameraBackend, CameraDevice, CameraError, CameraHandle, Capability, Detection, DeviceOpener,
    DeviceRegistry, V4l2Backend,
};
use export::{ExportError, ExportSummary, FrameExporter};
use recording::{RecordingSession, SessionDescriptor, SessionError, SessionOptions, SessionOutcome};

fn default_backend() -> Arc<dyn CameraBackend> {
    static BACKEND: OnceLock<Arc<dyn CameraBackend>> = OnceLock::new();
    Arc::clone(BACKEND.get_or_init(|| Arc::new(V4l2Backend::default())))
}

/// Process-wide opener, so the one-handle-per-device rule holds across callers.
fn default_opener() -> &'static DeviceOpener {
    static OPENER: OnceLock<DeviceOpener> = OnceLock::new();
    OPENER.get_or_init(|| DeviceOpener::new(default_backend()))
}

/// Enumerate connected cameras.
///
/// Zero cameras is a successful, empty [`Detection`]. Devices that did not
/// answer their probe in time are listed in `Detection::skipped`.
pub fn detect_cameras() -> Result<Detection, CameraError> {
    DeviceRegistry::new(default_backend()).detect_cameras()
}

/// Open `device` in the mode closest to `requested`, trying each access path
/// in order.
///
/// # Errors
/// * `CameraError::DeviceBusy` - already open here or held by another process
/// * `CameraError::PermissionDenied` - the OS refused access
/// * `CameraError::DeviceUnavailable` - no access path worked
pub fn open_with_fallback(
    device: &CameraDevice,
    requested: &Capability,
) -> Result<CameraHandle, CameraError> {
    default_opener().open_with_fallback(device, requested)
}

/// Start previewing and recording from two open cameras.
///
/// On error no session exists; the handles are released.
pub fn start_session(
    handles: [CameraHandle; 2],
    options: SessionOptions,
) -> Result<RecordingSession, SessionError> {
    let mut session = RecordingSession::new(handles, options);
    session.start_preview()?;
    session.start_recording()?;
    Ok(session)
}

/// Stop a recording, draining every queued frame, and return the written
/// descriptor.
///
/// # Errors
/// `SessionError::WriteFailure` or `SessionError::BackpressureOverflow` when
/// the session ended on a fault. The descriptor is still on disk, flagged as
/// failed.
pub fn stop_session(session: &mut RecordingSession) -> Result<SessionOutcome, SessionError> {
    session.stop()
}

/// Write every `interval`-th frame of each camera as a PNG next to the
/// session's files.
pub fn export_frames(
    descriptor: &SessionDescriptor,
    interval: u64,
) -> Result<ExportSummary, ExportError> {
    FrameExporter::new().export_frames(descriptor, interval)
}
