//! Hardware seam between the device layer and a concrete camera stack.

use std::path::PathBuf;

use super::errors::CameraError;
use super::types::{AccessPath, Capability, DriverInfo, RawFrame};

/// A candidate device node found during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    /// OS enumeration index
    pub index: u32,
    /// OS device path, e.g. `/dev/video0`
    pub os_path: PathBuf,
    /// Hardware-linked path that currently resolves to this node, if any
    pub hardware_path: Option<PathBuf>,
}

/// What a successful probe learned about a node.
///
/// An empty capability list means the node is not a video capture device.
#[derive(Debug, Clone, Default)]
pub struct ProbeInfo {
    pub driver_info: DriverInfo,
    pub capabilities: Vec<Capability>,
}

/// A running frame stream. Owned by exactly one capture worker.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<RawFrame, CameraError>;

    /// Mode the stream actually runs in.
    fn mode(&self) -> &Capability;
}

/// Platform camera stack.
///
/// `probe` may block; callers bound it with their own timeout.
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Enumerate candidate device nodes.
    fn scan(&self) -> Result<Vec<DeviceNode>, CameraError>;

    /// Query driver info and discrete modes of a node.
    fn probe(&self, node: &DeviceNode) -> Result<ProbeInfo, CameraError>;

    /// Open a stream on one access path. Succeeds only once a frame has been read.
    fn open(&self, path: &AccessPath, mode: &Capability)
        -> Result<Box<dyn FrameSource>, CameraError>;
}
