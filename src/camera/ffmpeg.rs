//! FFmpeg-backed frame source for v4l2 devices.
//!
//! The camera is read by an ffmpeg child process that decodes whatever the
//! device delivers (MJPEG, YUYV, ...) into raw RGB24 on stdout. One frame is
//! exactly `width * height * 3` bytes.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::backend::FrameSource;
use super::errors::CameraError;
use super::types::{Capability, RawFrame};

/// How long a graceful shutdown may take before the child is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A running ffmpeg capture process.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    stderr_thread: Option<JoinHandle<Vec<String>>>,
    mode: Capability,
    frame_len: usize,
    /// Frame read while verifying the stream, handed out first
    pending: Option<RawFrame>,
    device: String,
}

impl std::fmt::Debug for FfmpegSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegSource")
            .field("device", &self.device)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Build ffmpeg arguments for streaming `device` in `mode` as raw RGB24.
pub fn capture_args(device: &Path, mode: &Capability) -> Vec<String> {
    let size = mode.resolution.to_string();
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "v4l2".to_string(),
    ];
    if let Some(input_format) = mode.pixel_format.ffmpeg_input_format() {
        args.push("-input_format".to_string());
        args.push(input_format.to_string());
    }
    args.extend([
        "-video_size".to_string(),
        size.clone(),
        "-framerate".to_string(),
        mode.fps.to_string(),
        "-i".to_string(),
        device.display().to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        // Keep the output geometry fixed even if the driver adjusted the mode.
        "-s".to_string(),
        size,
        "-".to_string(),
    ]);
    args
}

/// Map ffmpeg's complaint about a device to a specific open failure.
pub fn classify_stderr(lines: &[String], device: &str) -> CameraError {
    let text = lines.join("\n").to_lowercase();
    if text.contains("device or resource busy") || text.contains("resource busy") {
        CameraError::DeviceBusy(device.to_string())
    } else if text.contains("permission denied") {
        CameraError::PermissionDenied(device.to_string())
    } else if text.contains("no such file or directory") || text.contains("no such device") {
        CameraError::DeviceUnavailable(device.to_string())
    } else {
        let detail = lines
            .last()
            .cloned()
            .unwrap_or_else(|| "ffmpeg exited without output".to_string());
        CameraError::StreamFailed(format!("{}: {}", device, detail))
    }
}

impl FfmpegSource {
    /// Start streaming `device` and wait for the first frame.
    ///
    /// # Errors
    /// * `CameraError::FfmpegNotFound` - ffmpeg is not installed
    /// * `CameraError::DeviceBusy` / `PermissionDenied` / `DeviceUnavailable` -
    ///   classified from ffmpeg's stderr when no frame arrives
    pub fn spawn(ffmpeg: &str, device: &Path, mode: &Capability) -> Result<Self, CameraError> {
        let args = capture_args(device, mode);
        log::debug!("Spawning {} {}", ffmpeg, args.join(" "));

        let mut child = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CameraError::FfmpegNotFound
                } else {
                    CameraError::StreamFailed(format!("failed to spawn ffmpeg: {}", e))
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CameraError::StreamFailed("ffmpeg stdout unavailable".to_string()))?;

        let stderr_thread = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let reader = BufReader::new(stderr);
                let mut lines = Vec::new();
                for line in reader.lines() {
                    match line {
                        Ok(l) => {
                            log::debug!("[ffmpeg] {}", l);
                            lines.push(l);
                        }
                        Err(_) => break,
                    }
                }
                lines
            })
        });

        let device_name = device.display().to_string();
        let mut source = Self {
            child,
            stdout,
            stderr_thread,
            mode: mode.clone(),
            frame_len: mode.resolution.rgb_frame_len(),
            pending: None,
            device: device_name.clone(),
        };

        match source.read_exact_frame() {
            Ok(frame) => {
                source.pending = Some(frame);
                Ok(source)
            }
            Err(_) => {
                source.shutdown();
                let lines = source.take_stderr_output();
                Err(classify_stderr(&lines, &device_name))
            }
        }
    }

    fn read_exact_frame(&mut self) -> std::io::Result<RawFrame> {
        let mut data = vec![0u8; self.frame_len];
        self.stdout.read_exact(&mut data)?;
        Ok(RawFrame {
            width: self.mode.resolution.width,
            height: self.mode.resolution.height,
            data,
        })
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask ffmpeg to stop with SIGINT, killing it if it does not exit in time.
    pub fn shutdown(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: the pid belongs to our own child, which has not been reaped yet.
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGINT);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }

        let start = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if start.elapsed() > SHUTDOWN_TIMEOUT {
                        let _ = self.child.kill();
                        let _ = self.child.wait();
                        return;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::warn!("Failed to wait for ffmpeg on {}: {}", self.device, e);
                    return;
                }
            }
        }
    }

    /// Get the collected stderr output after the process has finished.
    pub fn take_stderr_output(&mut self) -> Vec<String> {
        self.stderr_thread
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<RawFrame, CameraError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        self.read_exact_frame().map_err(|e| {
            CameraError::StreamFailed(format!("{}: {}", self.device, e))
        })
    }

    fn mode(&self) -> &Capability {
        &self.mode
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::PixelFormat;

    #[test]
    fn test_capture_args_mjpeg() {
        let mode = Capability::new(1280, 720, 30, PixelFormat::Mjpeg);
        let args = capture_args(Path::new("/dev/video2"), &mode);
        let joined = args.join(" ");
        assert!(joined.contains("-f v4l2 -input_format mjpeg"));
        assert!(joined.contains("-video_size 1280x720 -framerate 30 -i /dev/video2"));
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_capture_args_unknown_format_lets_driver_choose() {
        let mode = Capability::new(640, 480, 15, PixelFormat::Other("H264".into()));
        let args = capture_args(Path::new("/dev/video0"), &mode);
        assert!(!args.iter().any(|a| a == "-input_format"));
    }

    #[test]
    fn test_classify_busy() {
        let lines = vec![
            "[video4linux2,v4l2 @ 0x55] ioctl(VIDIOC_STREAMON): Device or resource busy".to_string(),
        ];
        assert_eq!(
            classify_stderr(&lines, "/dev/video0"),
            CameraError::DeviceBusy("/dev/video0".to_string())
        );
    }

    #[test]
    fn test_classify_permission() {
        let lines = vec!["/dev/video0: Permission denied".to_string()];
        assert!(matches!(
            classify_stderr(&lines, "/dev/video0"),
            CameraError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_classify_missing_node() {
        let lines = vec!["/dev/video9: No such file or directory".to_string()];
        assert!(matches!(
            classify_stderr(&lines, "/dev/video9"),
            CameraError::DeviceUnavailable(_)
        ));
    }

    #[test]
    fn test_classify_other_keeps_last_line() {
        let lines = vec!["first".to_string(), "Invalid argument".to_string()];
        match classify_stderr(&lines, "/dev/video0") {
            CameraError::StreamFailed(msg) => assert!(msg.contains("Invalid argument")),
            other => panic!("Expected StreamFailed, got {:?}", other),
        }
    }
}
