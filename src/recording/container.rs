//! Per-camera frame container (`.dcfr`).
//!
//! Layout, all integers little endian:
//!
//! ```text
//! header  : "DCFRAME1" | version u16 | pixel format u16 | width u32 | height u32
//!           | nominal fps * 1000 u32 | start epoch us i64
//! record  : "FRM0" | frame index u64 | sequence number u64 | timestamp us u64
//!           | payload length u32 | payload | sha256(payload)[..8]
//! ```
//!
//! Records have a fixed size for a given header, so frame `i` can be read
//! directly and a damaged record never hides the ones after it.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::camera::{CaptureFrame, Resolution};

pub const MAGIC: &[u8; 8] = b"DCFRAME1";
pub const RECORD_MAGIC: &[u8; 4] = b"FRM0";
pub const VERSION: u16 = 1;
/// Pixel format code for packed RGB24
pub const PIXFMT_RGB24: u16 = 1;
pub const HEADER_LEN: u64 = 32;
const RECORD_HEADER_LEN: u64 = 4 + 8 + 8 + 8 + 4;
const DIGEST_LEN: usize = 8;
/// Largest width or height a header may declare.
pub const MAX_DIMENSION: u32 = 16384;

/// Stream parameters stored in the container header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerHeader {
    pub resolution: Resolution,
    pub nominal_fps: f64,
    /// Wall-clock start shared by both files of a session
    pub start_epoch: DateTime<Utc>,
}

impl ContainerHeader {
    pub fn frame_len(&self) -> usize {
        self.resolution.rgb_frame_len()
    }

    /// Bytes taken by one record.
    pub fn record_len(&self) -> u64 {
        (self.frame_len() as u64).saturating_add(RECORD_HEADER_LEN + DIGEST_LEN as u64)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let Resolution { width, height } = self.resolution;
        let in_range = |d: u32| d > 0 && d <= MAX_DIMENSION;
        if !in_range(width) || !in_range(height) {
            return Err(DecodeError::BadDimensions { width, height });
        }
        Ok(())
    }

    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&VERSION.to_le_bytes());
        buf[10..12].copy_from_slice(&PIXFMT_RGB24.to_le_bytes());
        buf[12..16].copy_from_slice(&self.resolution.width.to_le_bytes());
        buf[16..20].copy_from_slice(&self.resolution.height.to_le_bytes());
        let fps_milli = (self.nominal_fps * 1000.0).round() as u32;
        buf[20..24].copy_from_slice(&fps_milli.to_le_bytes());
        buf[24..32].copy_from_slice(&self.start_epoch.timestamp_micros().to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self, DecodeError> {
        if &buf[0..8] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = u16::from_le_bytes([buf[8], buf[9]]);
        let pixfmt = u16::from_le_bytes([buf[10], buf[11]]);
        if version != VERSION || pixfmt != PIXFMT_RGB24 {
            return Err(DecodeError::Unsupported { version, pixfmt });
        }
        let width = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let height = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let fps_milli = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let mut epoch = [0u8; 8];
        epoch.copy_from_slice(&buf[24..32]);
        let epoch_us = i64::from_le_bytes(epoch);
        let start_epoch =
            DateTime::from_timestamp_micros(epoch_us).ok_or(DecodeError::BadEpoch(epoch_us))?;

        let header = Self {
            resolution: Resolution::new(width, height),
            nominal_fps: fps_milli as f64 / 1000.0,
            start_epoch,
        };
        header.validate()?;
        Ok(header)
    }
}

/// Checksum stored after each payload.
pub fn payload_digest(payload: &[u8]) -> [u8; DIGEST_LEN] {
    let hash = Sha256::digest(payload);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hash[..DIGEST_LEN]);
    out
}

/// Failure to decode a container or one of its records.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a frame container (bad magic)")]
    BadMagic,

    #[error("unsupported container version {version} / pixel format {pixfmt}")]
    Unsupported { version: u16, pixfmt: u16 },

    #[error("header declares an unusable frame size {width}x{height}")]
    BadDimensions { width: u32, height: u32 },

    #[error("header start time {0} us is out of range")]
    BadEpoch(i64),

    #[error("frame {index}: record is truncated")]
    Truncated { index: u64 },

    #[error("frame {index}: bad record marker")]
    BadRecord { index: u64 },

    #[error("frame {index}: record claims index {found}")]
    IndexMismatch { index: u64, found: u64 },

    #[error("frame {index}: payload is {found} bytes, expected {expected}")]
    LengthMismatch {
        index: u64,
        found: u32,
        expected: usize,
    },

    #[error("frame {index}: checksum mismatch (stored {stored}, computed {computed})")]
    ChecksumMismatch {
        index: u64,
        stored: String,
        computed: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Sequential frame writer.
pub struct ContainerWriter {
    file: BufWriter<File>,
    path: PathBuf,
    header: ContainerHeader,
    origin: Instant,
    frames_written: u64,
}

impl std::fmt::Debug for ContainerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerWriter")
            .field("path", &self.path)
            .field("frames_written", &self.frames_written)
            .finish_non_exhaustive()
    }
}

impl ContainerWriter {
    /// Create a new container. Fails if `path` already exists.
    ///
    /// # Arguments
    /// * `origin` - instant that frame timestamps are measured from
    pub fn create(path: &Path, header: ContainerHeader, origin: Instant) -> io::Result<Self> {
        header
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut file = BufWriter::with_capacity(1 << 20, file);
        file.write_all(&header.encode())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            origin,
            frames_written: 0,
        })
    }

    /// Append one frame and return its index.
    pub fn append(&mut self, frame: &CaptureFrame) -> io::Result<u64> {
        let payload = &frame.pixel_buffer[..];
        if payload.len() != self.header.frame_len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "frame is {} bytes, container expects {}",
                    payload.len(),
                    self.header.frame_len()
                ),
            ));
        }

        let index = self.frames_written;
        let timestamp_us = frame
            .capture_timestamp
            .saturating_duration_since(self.origin)
            .as_micros() as u64;

        self.file.write_all(RECORD_MAGIC)?;
        self.file.write_all(&index.to_le_bytes())?;
        self.file.write_all(&frame.sequence_number.to_le_bytes())?;
        self.file.write_all(&timestamp_us.to_le_bytes())?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(payload)?;
        self.file.write_all(&payload_digest(payload))?;

        self.frames_written += 1;
        Ok(index)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and sync to disk.
    ///
    /// Bytes of a record whose append failed are cut off, so the file holds
    /// exactly the frames that were reported written.
    pub fn finish(self) -> io::Result<u64> {
        let committed = HEADER_LEN + self.frames_written * self.header.record_len();
        let record_len = self.header.record_len();
        match self.file.into_inner() {
            Ok(file) => {
                trim_partial_record(&file, committed, record_len)?;
                file.sync_all()?;
                Ok(self.frames_written)
            }
            Err(e) => {
                let (error, writer) = e.into_parts();
                let (file, _unflushed) = writer.into_parts();
                if let Err(trim) = trim_partial_record(&file, committed, record_len) {
                    log::warn!("{}: cannot trim partial record: {}", self.path.display(), trim);
                }
                Err(error)
            }
        }
    }
}

/// Cut the file back to whole records, at most `committed` bytes.
fn trim_partial_record(file: &File, committed: u64, record_len: u64) -> io::Result<()> {
    let len = file.metadata()?.len();
    if len <= HEADER_LEN {
        return Ok(());
    }
    let whole = HEADER_LEN + (len - HEADER_LEN) / record_len * record_len;
    let keep = whole.min(committed);
    if keep < len {
        file.set_len(keep)?;
    }
    Ok(())
}

/// One decoded record.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_index: u64,
    pub sequence_number: u64,
    /// Microseconds since the recording started
    pub timestamp_us: u64,
    pub resolution: Resolution,
    pub pixels: Vec<u8>,
}

/// Random-access frame reader.
#[derive(Debug)]
pub struct ContainerReader {
    file: File,
    header: ContainerHeader,
    slots: u64,
}

impl ContainerReader {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => DecodeError::BadMagic,
            _ => DecodeError::Io(e),
        })?;
        let header = ContainerHeader::decode(&buf)?;

        let body = file.metadata()?.len().saturating_sub(HEADER_LEN);
        let record_len = header.record_len();
        // A partial trailing record still gets a slot so it reports as truncated.
        let slots = body.div_ceil(record_len);
        Ok(Self { file, header, slots })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// Records present in the file, including a partial last one.
    pub fn frame_slots(&self) -> u64 {
        self.slots
    }

    /// Decode frame `index`, verifying its marker, index, length and checksum.
    pub fn read_at(&mut self, index: u64) -> Result<DecodedFrame, DecodeError> {
        let offset = index
            .checked_mul(self.header.record_len())
            .and_then(|o| o.checked_add(HEADER_LEN))
            .ok_or(DecodeError::Truncated { index })?;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut head = [0u8; RECORD_HEADER_LEN as usize];
        read_record_part(&mut self.file, &mut head, index)?;
        if &head[0..4] != RECORD_MAGIC {
            return Err(DecodeError::BadRecord { index });
        }
        let u64_at = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&head[o..o + 8]);
            u64::from_le_bytes(b)
        };
        let found_index = u64_at(4);
        let sequence_number = u64_at(12);
        let timestamp_us = u64_at(20);
        let len = u32::from_le_bytes([head[28], head[29], head[30], head[31]]);

        if found_index != index {
            return Err(DecodeError::IndexMismatch {
                index,
                found: found_index,
            });
        }
        let expected = self.header.frame_len();
        if len as usize != expected {
            return Err(DecodeError::LengthMismatch {
                index,
                found: len,
                expected,
            });
        }

        let mut pixels = vec![0u8; expected];
        read_record_part(&mut self.file, &mut pixels, index)?;
        let mut stored = [0u8; DIGEST_LEN];
        read_record_part(&mut self.file, &mut stored, index)?;
        let computed = payload_digest(&pixels);
        if stored != computed {
            return Err(DecodeError::ChecksumMismatch {
                index,
                stored: hex::encode(stored),
                computed: hex::encode(computed),
            });
        }

        Ok(DecodedFrame {
            frame_index: index,
            sequence_number,
            timestamp_us,
            resolution: self.header.resolution,
            pixels,
        })
    }
}

fn read_record_part(file: &mut File, buf: &mut [u8], index: u64) -> Result<(), DecodeError> {
    file.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => DecodeError::Truncated { index },
        _ => DecodeError::Io(e),
    })
}
