//! Still-image export from a finished session.
//!
//! Frames are numbered by 1-based ordinal within their camera's recording.
//! With interval `K`, ordinals `K, 2K, 3K, ...` are exported, which yields
//! `floor(frame_count / K)` images per camera.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::camera::frame_utils::rotate_rgb;
use crate::camera::{CameraId, Rotation};
use crate::recording::{
    CameraOutput, ContainerReader, DecodeError, DescriptorError, SessionDescriptor,
};

/// One written image.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedFrame {
    pub camera_id: CameraId,
    /// 1-based frame ordinal within the camera's recording
    pub source_frame_index: u64,
    /// Capture time relative to the recording start
    pub source_timestamp_us: u64,
    /// `source_frame_index / nominal_fps`, in seconds
    pub relative_timestamp: f64,
    pub image_path: PathBuf,
}

/// A frame that could not be exported. The pass continues without it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{camera_id} frame {source_frame_index}: {message}")]
pub struct ExportDecodeError {
    pub camera_id: CameraId,
    pub source_frame_index: u64,
    pub message: String,
}

/// Per-camera result.
#[derive(Debug, Clone, Default)]
pub struct CameraExport {
    pub exported: Vec<ExportedFrame>,
    pub skipped: Vec<ExportDecodeError>,
}

/// Result of an export pass.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub output_dir: PathBuf,
    pub interval: u64,
    pub cameras: Vec<(CameraId, CameraExport)>,
}

impl ExportSummary {
    pub fn camera(&self, camera: CameraId) -> Option<&CameraExport> {
        self.cameras
            .iter()
            .find(|(id, _)| *id == camera)
            .map(|(_, e)| e)
    }

    pub fn exported_count(&self) -> usize {
        self.cameras.iter().map(|(_, e)| e.exported.len()).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.cameras.iter().map(|(_, e)| e.skipped.len()).sum()
    }
}

/// Errors that stop an export pass.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Export interval must be at least 1, got {0}")]
    InvalidInterval(u64),

    #[error("Cannot read {camera} recording '{}': {source}", path.display())]
    Container {
        camera: CameraId,
        path: PathBuf,
        #[source]
        source: DecodeError,
    },

    #[error("Failed to write '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Deterministic image name; lexicographic order equals temporal order.
///
/// `camera1_f00000090_src000003001234us_rel00000003.000s.png`
pub fn image_file_name(
    camera: CameraId,
    source_frame_index: u64,
    source_timestamp_us: u64,
    relative_timestamp: f64,
) -> String {
    format!(
        "{}_f{:08}_src{:015}us_rel{:012.3}s.png",
        camera, source_frame_index, source_timestamp_us, relative_timestamp
    )
}

/// Writes interval-sampled PNGs from a session's containers.
#[derive(Debug, Clone, Default)]
pub struct FrameExporter {
    output_dir: Option<PathBuf>,
}

impl FrameExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write images here instead of `<session>/frames_every_<K>`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Export every `interval`-th frame of each camera.
    ///
    /// # Errors
    /// * `ExportError::InvalidInterval` - `interval` is 0
    /// * `ExportError::Container` - a container header is unreadable
    /// * `ExportError::Io` - the output directory or an image cannot be written
    ///
    /// Damaged individual frames are reported in the summary, not as errors.
    pub fn export_frames(
        &self,
        descriptor: &SessionDescriptor,
        interval: u64,
    ) -> Result<ExportSummary, ExportError> {
        if interval == 0 {
            return Err(ExportError::InvalidInterval(interval));
        }
        let output_dir = self.output_dir.clone().unwrap_or_else(|| {
            descriptor
                .session_dir
                .join(format!("frames_every_{}", interval))
        });
        std::fs::create_dir_all(&output_dir).map_err(|source| ExportError::Io {
            path: output_dir.clone(),
            source,
        })?;

        let mut cameras = Vec::with_capacity(descriptor.cameras.len());
        for output in &descriptor.cameras {
            let result = export_camera(descriptor, output, interval, &output_dir)?;
            log::info!(
                "{}: exported {} frame(s), skipped {}",
                output.camera_id,
                result.exported.len(),
                result.skipped.len()
            );
            cameras.push((output.camera_id, result));
        }

        Ok(ExportSummary {
            output_dir,
            interval,
            cameras,
        })
    }
}

fn export_camera(
    descriptor: &SessionDescriptor,
    output: &CameraOutput,
    interval: u64,
    output_dir: &Path,
) -> Result<CameraExport, ExportError> {
    let camera = output.camera_id;
    let path = descriptor.session_dir.join(&output.output_path);
    let mut reader = ContainerReader::open(&path).map_err(|source| ExportError::Container {
        camera,
        path: path.clone(),
        source,
    })?;

    let fps = if output.nominal_fps > 0.0 {
        output.nominal_fps
    } else {
        reader.header().nominal_fps
    };
    let mut result = CameraExport::default();

    for ordinal in (interval..=output.frame_count).step_by(interval as usize) {
        let index = ordinal - 1;
        let frame = match reader.read_at(index) {
            Ok(frame) if frame.sequence_number == index => frame,
            Ok(frame) => {
                skip(
                    &mut result,
                    camera,
                    ordinal,
                    format!("sequence number {} at index {}", frame.sequence_number, index),
                );
                continue;
            }
            Err(e) => {
                skip(&mut result, camera, ordinal, e.to_string());
                continue;
            }
        };

        let relative_timestamp = ordinal as f64 / fps;
        let image_path = output_dir.join(image_file_name(
            camera,
            ordinal,
            frame.timestamp_us,
            relative_timestamp,
        ));
        write_png(
            &image_path,
            &frame.pixels,
            frame.resolution.width,
            frame.resolution.height,
            output.rotation,
        )?;

        result.exported.push(ExportedFrame {
            camera_id: camera,
            source_frame_index: ordinal,
            source_timestamp_us: frame.timestamp_us,
            relative_timestamp,
            image_path,
        });
    }

    Ok(result)
}

fn skip(result: &mut CameraExport, camera: CameraId, ordinal: u64, message: String) {
    let error = ExportDecodeError {
        camera_id: camera,
        source_frame_index: ordinal,
        message,
    };
    log::warn!("Skipping {}", error);
    result.skipped.push(error);
}

fn write_png(
    path: &Path,
    pixels: &[u8],
    width: u32,
    height: u32,
    rotation: Rotation,
) -> Result<(), ExportError> {
    let image = rotate_rgb(pixels, width, height, rotation);
    let io_err = |source: std::io::Error| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let png_err = |e: png::EncodingError| {
        io_err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    };

    let file = File::create(path).map_err(io_err)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), image.width, image.height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(png_err)?;
    writer.write_image_data(&image.data).map_err(png_err)?;
    writer.finish().map_err(png_err)?;
    Ok(())
}
