//! Camera detection and stable identity assignment.

use std::collections::{BTreeSet, HashSet};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::backend::{CameraBackend, DeviceNode, ProbeInfo};
use super::errors::CameraError;
use super::types::{AccessPath, CameraDevice, IdentitySource, StableId};

/// Default time a single device gets to answer its probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A node that was found but left out of the detection result.
#[derive(Debug, Clone)]
pub struct ProbeFailure {
    pub node: DeviceNode,
    pub error: CameraError,
}

/// Result of one detection pass.
///
/// `devices` may be empty; use [`Detection::select_pair`] or check
/// [`Detection::is_empty`] rather than assuming cameras exist.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// Responsive cameras, sorted by stable id
    pub devices: Vec<CameraDevice>,
    /// Nodes skipped because of a probe failure or timeout
    pub skipped: Vec<ProbeFailure>,
}

impl Detection {
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn find(&self, id: &StableId) -> Option<&CameraDevice> {
        self.devices.iter().find(|d| &d.stable_id == id)
    }

    /// The two cameras of a dual recording, in stable-id order.
    ///
    /// # Errors
    /// * `CameraError::NoDevicesFound` - nothing was detected
    /// * `CameraError::InsufficientDevices` - only one camera was detected
    pub fn select_pair(&self) -> Result<[CameraDevice; 2], CameraError> {
        match self.devices.as_slice() {
            [] => Err(CameraError::NoDevicesFound),
            [_] => Err(CameraError::InsufficientDevices { found: 1 }),
            [first, second, ..] => Ok([first.clone(), second.clone()]),
        }
    }
}

/// Enumerates camera hardware through a [`CameraBackend`].
#[derive(Clone)]
pub struct DeviceRegistry {
    backend: Arc<dyn CameraBackend>,
    probe_timeout: Duration,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("backend", &self.backend.name())
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CameraBackend> {
        &self.backend
    }

    /// Scan all nodes and probe them concurrently.
    ///
    /// A node that does not answer within the probe timeout is reported in
    /// `skipped` with `ProbeTimeout`; its probe thread is abandoned, not
    /// retried. Nodes without any discrete capture mode are not cameras and
    /// are dropped silently.
    ///
    /// # Errors
    /// Returns an error only if the backend cannot enumerate nodes at all.
    pub fn detect_cameras(&self) -> Result<Detection, CameraError> {
        let nodes = self.backend.scan()?;
        log::debug!(
            "Scanning {} node(s) with the {} backend",
            nodes.len(),
            self.backend.name()
        );

        let (tx, rx) = mpsc::channel();
        for (slot, node) in nodes.iter().enumerate() {
            let tx = tx.clone();
            let backend = Arc::clone(&self.backend);
            let node = node.clone();
            let spawned = thread::Builder::new()
                .name(format!("probe-video{}", node.index))
                .spawn(move || {
                    let result = backend.probe(&node);
                    let _ = tx.send((slot, result));
                });
            if let Err(e) = spawned {
                log::warn!("Could not spawn probe thread: {}", e);
            }
        }
        drop(tx);

        let mut results: Vec<Option<Result<ProbeInfo, CameraError>>> = vec![None; nodes.len()];
        let deadline = Instant::now() + self.probe_timeout;
        let mut pending = nodes.len();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((slot, result)) => {
                    results[slot] = Some(result);
                    pending -= 1;
                }
                Err(_) => break,
            }
        }

        let mut detection = Detection::default();
        let mut seen = HashSet::new();
        for (node, result) in nodes.into_iter().zip(results) {
            match result {
                Some(Ok(info)) => {
                    let Some(device) = build_device(&node, info) else {
                        log::debug!("{} has no capture modes, skipping", node.os_path.display());
                        continue;
                    };
                    if !seen.insert(device.stable_id.clone()) {
                        log::debug!(
                            "{} is another node of {}, skipping",
                            node.os_path.display(),
                            device.stable_id
                        );
                        continue;
                    }
                    detection.devices.push(device);
                }
                Some(Err(error)) => {
                    log::warn!("Probe of {} failed: {}", node.os_path.display(), error);
                    detection.skipped.push(ProbeFailure { node, error });
                }
                None => {
                    let error = CameraError::ProbeTimeout {
                        path: node.os_path.clone(),
                        timeout: self.probe_timeout,
                    };
                    log::warn!("{}", error);
                    detection.skipped.push(ProbeFailure { node, error });
                }
            }
        }

        detection.devices.sort_by(|a, b| a.stable_id.cmp(&b.stable_id));
        log::info!(
            "Detected {} camera(s), skipped {} node(s)",
            detection.devices.len(),
            detection.skipped.len()
        );
        Ok(detection)
    }
}

/// Turn a probed node into a device, or `None` if it has no capture modes.
pub fn build_device(node: &DeviceNode, info: ProbeInfo) -> Option<CameraDevice> {
    if info.capabilities.is_empty() {
        return None;
    }

    let (stable_id, identity) = match (&node.hardware_path, &info.driver_info) {
        (Some(path), _) => (StableId::from_hardware_path(path), IdentitySource::HardwarePath),
        (None, driver) => match (&driver.driver, &driver.bus) {
            (Some(name), Some(bus)) => (StableId::from_driver_bus(name, bus), IdentitySource::DriverBus),
            _ => {
                log::warn!(
                    "{} has no hardware path or bus info; its identity may change on replug",
                    node.os_path.display()
                );
                (StableId::from_index(node.index), IdentitySource::OsIndex)
            }
        },
    };

    let mut access_candidates = Vec::with_capacity(3);
    if let Some(path) = &node.hardware_path {
        access_candidates.push(AccessPath::StablePath(path.clone()));
    }
    access_candidates.push(AccessPath::OsPath(node.os_path.clone()));
    access_candidates.push(AccessPath::Index(node.index));

    Some(CameraDevice {
        stable_id,
        identity,
        os_index: node.index,
        access_candidates,
        capabilities: info.capabilities.into_iter().collect::<BTreeSet<_>>(),
        driver_info: info.driver_info,
    })
}
