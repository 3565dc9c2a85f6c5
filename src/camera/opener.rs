//! Opening cameras through an ordered list of access paths.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use super::backend::{CameraBackend, FrameSource};
use super::errors::CameraError;
use super::types::{AccessPath, CameraDevice, Capability, RawFrame, StableId};

type LeaseTable = Arc<Mutex<HashSet<StableId>>>;

/// Exclusive claim on a stable id, released on drop.
struct Lease {
    stable_id: StableId,
    table: LeaseTable,
}

impl Lease {
    fn acquire(table: &LeaseTable, stable_id: &StableId) -> Result<Self, CameraError> {
        let mut held = table.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(stable_id.clone()) {
            return Err(CameraError::DeviceBusy(stable_id.to_string()));
        }
        Ok(Self {
            stable_id: stable_id.clone(),
            table: Arc::clone(table),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.stable_id);
    }
}

/// An open camera. Exactly one exists per stable id per opener.
pub struct CameraHandle {
    device: CameraDevice,
    opened_via: AccessPath,
    source: Box<dyn FrameSource>,
    _lease: Lease,
}

impl fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraHandle")
            .field("stable_id", &self.device.stable_id)
            .field("opened_via", &self.opened_via)
            .field("mode", self.source.mode())
            .finish_non_exhaustive()
    }
}

impl CameraHandle {
    pub fn device(&self) -> &CameraDevice {
        &self.device
    }

    pub fn stable_id(&self) -> &StableId {
        &self.device.stable_id
    }

    /// Access path that succeeded.
    pub fn opened_via(&self) -> &AccessPath {
        &self.opened_via
    }

    /// Mode the stream runs in.
    pub fn mode(&self) -> &Capability {
        self.source.mode()
    }

    /// Block until the next frame is available.
    pub fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
        self.source.read_frame()
    }
}

/// Opens [`CameraDevice`]s and tracks which ones are currently held.
#[derive(Clone)]
pub struct DeviceOpener {
    backend: Arc<dyn CameraBackend>,
    leases: LeaseTable,
}

impl fmt::Debug for DeviceOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOpener")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl DeviceOpener {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a handle for `stable_id` is currently open.
    pub fn is_open(&self, stable_id: &StableId) -> bool {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(stable_id)
    }

    /// Open `device` in the mode closest to `requested`.
    ///
    /// Access candidates are tried in order; the first path that delivers a
    /// frame wins. When every path fails, the most specific cause is returned:
    /// busy over permission over plain unavailability.
    ///
    /// # Errors
    /// * `CameraError::DeviceBusy` - a handle for this stable id is already
    ///   open, or the hardware is held by another process
    /// * `CameraError::PermissionDenied` - the OS refused access
    /// * `CameraError::DeviceUnavailable` - no access path could be opened
    pub fn open_with_fallback(
        &self,
        device: &CameraDevice,
        requested: &Capability,
    ) -> Result<CameraHandle, CameraError> {
        let lease = Lease::acquire(&self.leases, &device.stable_id)?;
        let mode = negotiate_mode(&device.capabilities, requested);
        if mode != *requested {
            log::info!("{}: requested {}, using {}", device.stable_id, requested, mode);
        }

        let mut busy = false;
        let mut denied: Option<CameraError> = None;
        for candidate in &device.access_candidates {
            log::debug!("{}: trying {}", device.stable_id, candidate);
            match self.backend.open(candidate, &mode) {
                Ok(source) => {
                    log::info!(
                        "Opened {} via {} ({})",
                        device.stable_id,
                        candidate,
                        source.mode()
                    );
                    return Ok(CameraHandle {
                        device: device.clone(),
                        opened_via: candidate.clone(),
                        source,
                        _lease: lease,
                    });
                }
                Err(CameraError::FfmpegNotFound) => return Err(CameraError::FfmpegNotFound),
                Err(e) => {
                    log::warn!("{}: {} failed: {}", device.stable_id, candidate, e);
                    match e {
                        CameraError::DeviceBusy(_) => busy = true,
                        CameraError::PermissionDenied(_) => denied = Some(e),
                        _ => {}
                    }
                }
            }
        }

        Err(if busy {
            CameraError::DeviceBusy(device.stable_id.to_string())
        } else if let Some(denied) = denied {
            denied
        } else {
            CameraError::DeviceUnavailable(device.stable_id.to_string())
        })
    }
}

/// Pick the discrete mode closest to `requested`.
///
/// Exact match first; otherwise the largest mode that fits inside the
/// requested resolution at a frame rate not above the requested one, with
/// the requested pixel format only breaking ties. A faster mode of a fitting
/// size is taken only when no slower one exists, and if no size fits, the
/// smallest mode. A device that reported no modes is asked for `requested`
/// as is.
pub fn negotiate_mode(capabilities: &BTreeSet<Capability>, requested: &Capability) -> Capability {
    if capabilities.is_empty() || capabilities.contains(requested) {
        return requested.clone();
    }

    let same_format = |c: &Capability| c.pixel_format == requested.pixel_format;
    let fitting = || {
        capabilities
            .iter()
            .filter(|c| c.resolution.fits_within(&requested.resolution))
    };

    let within_rate = fitting()
        .filter(|c| c.fps <= requested.fps)
        .max_by_key(|c| (c.resolution.area(), c.fps, same_format(c)));

    let above_rate = || {
        fitting().max_by_key(|c| {
            (
                c.resolution.area(),
                std::cmp::Reverse(c.fps),
                same_format(c),
            )
        })
    };

    let smallest = || {
        capabilities.iter().min_by_key(|c| {
            (
                c.resolution.area(),
                c.fps.abs_diff(requested.fps),
                !same_format(c),
            )
        })
    };

    within_rate
        .or_else(above_rate)
        .or_else(smallest)
        .cloned()
        .unwrap_or_else(|| requested.clone())
}
