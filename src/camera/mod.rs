//! Camera detection, opening and capture.
//!
//! This module provides:
//! - Device enumeration with stable identities via [`DeviceRegistry`]
//! - Fallback opening with one handle per device via [`DeviceOpener`]
//! - The per-camera capture thread via [`CaptureWorker`]
//! - Backends: [`V4l2Backend`] for Linux hardware, [`SyntheticBackend`] for
//!   tests and demos

mod backend;
mod capture_loop;
mod errors;
mod ffmpeg;
pub mod frame_utils;
mod opener;
mod registry;
pub mod synthetic;
mod types;
mod v4l2;

pub use backend::{CameraBackend, DeviceNode, FrameSource, ProbeInfo};
pub use capture_loop::{CaptureWorker, RecordingTap, TapPoll};
pub use errors::CameraError;
pub use ffmpeg::FfmpegSource;
pub use opener::{negotiate_mode, CameraHandle, DeviceOpener};
pub use registry::{build_device, Detection, DeviceRegistry, ProbeFailure, DEFAULT_PROBE_TIMEOUT};
pub use synthetic::SyntheticBackend;
pub use types::{
    AccessPath, CameraDevice, CameraId, Capability, CaptureFrame, DriverInfo, IdentitySource,
    PixelFormat, RawFrame, Resolution, Rotation, StableId,
};
pub use v4l2::{parse_formats, parse_info, V4l2Backend};
