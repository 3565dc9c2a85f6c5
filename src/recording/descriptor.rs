//! Persisted session summary (`session.json`).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::camera::{CameraId, Resolution, Rotation, StableId};

/// What ended a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WriteFailure,
    BackpressureOverflow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub camera: CameraId,
    pub message: String,
}

/// One camera's recorded output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraOutput {
    pub camera_id: CameraId,
    pub stable_id: StableId,
    pub device_name: String,
    /// File name relative to the session directory
    pub output_path: PathBuf,
    /// Frames written to the output file
    pub frame_count: u64,
    pub resolution: Resolution,
    pub nominal_fps: f64,
    pub rotation: Rotation,
    /// The camera's capture source failed mid-session
    #[serde(default)]
    pub faulted: bool,
}

/// Summary of a finished recording session. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub start_epoch: DateTime<Utc>,
    pub stop_epoch: DateTime<Utc>,
    pub duration_secs: f64,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    pub cameras: Vec<CameraOutput>,
    /// Directory the descriptor lives in; filled in on write and load
    #[serde(skip)]
    pub session_dir: PathBuf,
}

/// Errors reading or writing a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Session descriptor {} already exists; descriptors are written once", .0.display())]
    AlreadyWritten(PathBuf),

    #[error("Failed to access session descriptor '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse session descriptor '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SessionDescriptor {
    pub const FILE_NAME: &'static str = "session.json";

    /// Persist into `session_dir`. Fails if a descriptor is already there.
    pub fn write(&self, session_dir: &Path) -> Result<PathBuf, DescriptorError> {
        let path = session_dir.join(Self::FILE_NAME);
        let json = serde_json::to_vec_pretty(self).map_err(|source| DescriptorError::Parse {
            path: path.clone(),
            source,
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    DescriptorError::AlreadyWritten(path.clone())
                } else {
                    DescriptorError::Io {
                        path: path.clone(),
                        source,
                    }
                }
            })?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|source| DescriptorError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Load a descriptor from `session.json` or from the directory holding it.
    pub fn load(path: &Path) -> Result<Self, DescriptorError> {
        let file = if path.is_dir() {
            path.join(Self::FILE_NAME)
        } else {
            path.to_path_buf()
        };
        let content = std::fs::read(&file).map_err(|source| DescriptorError::Io {
            path: file.clone(),
            source,
        })?;
        let mut descriptor: SessionDescriptor =
            serde_json::from_slice(&content).map_err(|source| DescriptorError::Parse {
                path: file.clone(),
                source,
            })?;
        descriptor.session_dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(descriptor)
    }

    pub fn camera(&self, camera: CameraId) -> Option<&CameraOutput> {
        self.cameras.iter().find(|c| c.camera_id == camera)
    }

    /// Absolute path of a camera's output file.
    pub fn output_file(&self, camera: CameraId) -> Option<PathBuf> {
        self.camera(camera)
            .map(|c| self.session_dir.join(&c.output_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SessionDescriptor {
        let start = Utc::now();
        SessionDescriptor {
            session_id: Uuid::new_v4(),
            start_epoch: start,
            stop_epoch: start + chrono::Duration::seconds(3),
            duration_secs: 3.0,
            failed: false,
            failure: None,
            cameras: CameraId::PAIR
                .iter()
                .map(|&id| CameraOutput {
                    camera_id: id,
                    stable_id: StableId::from_index(id.0 as u32),
                    device_name: format!("Cam {}", id.0),
                    output_path: PathBuf::from(format!("{}.dcfr", id)),
                    frame_count: 90,
                    resolution: Resolution::HD,
                    nominal_fps: 30.0,
                    rotation: Rotation::Cw90,
                    faulted: false,
                })
                .collect(),
            session_dir: PathBuf::new(),
        }
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let descriptor = sample();
        let path = descriptor.write(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("session.json"));

        let loaded = SessionDescriptor::load(&path).unwrap();
        assert_eq!(loaded.session_id, descriptor.session_id);
        assert_eq!(loaded.session_dir, dir.path());
        assert_eq!(
            loaded.output_file(CameraId::SECOND),
            Some(dir.path().join("camera2.dcfr"))
        );
        assert_eq!(loaded.camera(CameraId::FIRST).unwrap().rotation, Rotation::Cw90);

        let from_dir = SessionDescriptor::load(dir.path()).unwrap();
        assert_eq!(from_dir.cameras.len(), 2);
    }

    #[test]
    fn test_written_only_once() {
        let dir = TempDir::new().unwrap();
        sample().write(dir.path()).unwrap();
        assert!(matches!(
            sample().write(dir.path()),
            Err(DescriptorError::AlreadyWritten(_))
        ));
    }

    #[test]
    fn test_failure_record_serialization() {
        let mut descriptor = sample();
        descriptor.failed = true;
        descriptor.failure = Some(FailureRecord {
            kind: FailureKind::BackpressureOverflow,
            camera: CameraId::SECOND,
            message: "queue full".to_string(),
        });
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"backpressure_overflow\""));
        assert!(json.contains("\"rotation\":90"));
        assert!(!json.contains("session_dir"));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = SessionDescriptor::load(Path::new("/nonexistent/session.json")).unwrap_err();
        assert!(format!("{}", err).contains("/nonexistent/session.json"));
    }
}
