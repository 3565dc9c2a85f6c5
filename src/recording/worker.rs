//! Recording thread: drains one camera's recording queue into its file.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};

use super::container::{ContainerHeader, ContainerWriter};
use crate::camera::{CameraError, CameraId, CaptureFrame, Resolution};
use crate::queue::RecordingQueue;

/// Messages from capture and recording threads to the session supervisor.
#[derive(Debug)]
pub enum WorkerReport {
    /// A capture source broke; the camera stopped capturing
    CaptureFault { camera: CameraId, error: CameraError },
    /// A recording queue refused a frame at its memory ceiling
    Overflow {
        camera: CameraId,
        queued_bytes: usize,
        ceiling: usize,
    },
    /// A recording worker exited; `error` is set if it stopped on a failure
    RecorderFinished {
        camera: CameraId,
        frames_written: u64,
        error: Option<String>,
    },
}

/// Parameters of one camera's recorded stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamSpec {
    pub camera_id: CameraId,
    pub resolution: Resolution,
    pub nominal_fps: f64,
    /// Instant frame timestamps are measured from
    pub origin: Instant,
    /// Wall-clock time matching `origin`, the same for both cameras
    pub start_epoch: DateTime<Utc>,
}

/// Destination of recorded frames.
pub trait FrameSink: Send {
    fn append(&mut self, frame: &CaptureFrame) -> io::Result<()>;

    /// Flush and close. Called exactly once.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Creates one sink per camera when recording starts.
pub trait SinkFactory: Send + Sync {
    fn create(&self, path: &Path, spec: &StreamSpec) -> io::Result<Box<dyn FrameSink>>;
}

impl FrameSink for ContainerWriter {
    fn append(&mut self, frame: &CaptureFrame) -> io::Result<()> {
        ContainerWriter::append(self, frame).map(|_| ())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        ContainerWriter::finish(*self).map(|_| ())
    }
}

/// Writes `.dcfr` containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerSinkFactory;

impl SinkFactory for ContainerSinkFactory {
    fn create(&self, path: &Path, spec: &StreamSpec) -> io::Result<Box<dyn FrameSink>> {
        let header = ContainerHeader {
            resolution: spec.resolution,
            nominal_fps: spec.nominal_fps,
            start_epoch: spec.start_epoch,
        };
        Ok(Box::new(ContainerWriter::create(path, header, spec.origin)?))
    }
}

/// Drains a recording queue in FIFO order.
pub struct RecordingWorker {
    camera: CameraId,
    queue: Arc<RecordingQueue>,
    sink: Box<dyn FrameSink>,
    progress: Arc<AtomicU64>,
    reports: Sender<WorkerReport>,
}

impl RecordingWorker {
    /// # Arguments
    /// * `progress` - updated with the number of frames written so far
    pub fn new(
        camera: CameraId,
        queue: Arc<RecordingQueue>,
        sink: Box<dyn FrameSink>,
        progress: Arc<AtomicU64>,
        reports: Sender<WorkerReport>,
    ) -> Self {
        Self {
            camera,
            queue,
            sink,
            progress,
            reports,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("record-{}", self.camera))
            .spawn(move || self.run())
    }

    fn run(mut self) {
        log::info!("{}: recording started", self.camera);
        let mut written: u64 = 0;
        let mut error = None;

        while let Some(frame) = self.queue.pop() {
            if frame.sequence_number != written {
                error = Some(format!(
                    "sequence gap: expected frame {}, got {}",
                    written, frame.sequence_number
                ));
                break;
            }
            if let Err(e) = self.sink.append(&frame) {
                error = Some(e.to_string());
                break;
            }
            written += 1;
            self.progress.store(written, Ordering::Release);
        }

        if error.is_some() {
            // Unblock the capture thread; nothing more will be written.
            self.queue.abort();
        }
        if let Err(e) = self.sink.finish() {
            error.get_or_insert_with(|| format!("failed to finalize output: {}", e));
        }

        match &error {
            Some(e) => log::error!("{}: recording failed after {} frames: {}", self.camera, written, e),
            None => log::info!("{}: recording finished, {} frames", self.camera, written),
        }
        let _ = self.reports.send(WorkerReport::RecorderFinished {
            camera: self.camera,
            frames_written: written,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::RawFrame;
    use crate::recording::container::ContainerReader;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn frame(seq: u64) -> CaptureFrame {
        CaptureFrame::from_raw(
            CameraId::FIRST,
            seq,
            Instant::now(),
            RawFrame {
                width: 2,
                height: 2,
                data: vec![seq as u8; 12],
            },
        )
    }

    struct FailingSink {
        fail_at: u64,
        seen: u64,
    }

    impl FrameSink for FailingSink {
        fn append(&mut self, _frame: &CaptureFrame) -> io::Result<()> {
            if self.seen == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::Other, "No space left on device"));
            }
            self.seen += 1;
            Ok(())
        }

        fn finish(self: Box<Self>) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_worker(
        queue: Arc<RecordingQueue>,
        sink: Box<dyn FrameSink>,
    ) -> (WorkerReport, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel();
        let progress = Arc::new(AtomicU64::new(0));
        RecordingWorker::new(CameraId::FIRST, queue, sink, Arc::clone(&progress), tx)
            .spawn()
            .unwrap()
            .join()
            .unwrap();
        (rx.recv_timeout(Duration::from_secs(1)).unwrap(), progress)
    }

    #[test]
    fn test_drains_queue_into_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("camera1.dcfr");
        let spec = StreamSpec {
            camera_id: CameraId::FIRST,
            resolution: Resolution::new(2, 2),
            nominal_fps: 30.0,
            origin: Instant::now(),
            start_epoch: Utc::now(),
        };
        let sink = ContainerSinkFactory.create(&path, &spec).unwrap();

        let queue = Arc::new(RecordingQueue::new(16, usize::MAX));
        for seq in 0..5 {
            queue.push(frame(seq)).unwrap();
        }
        queue.close();

        let (report, progress) = run_worker(queue, sink);
        match report {
            WorkerReport::RecorderFinished {
                frames_written,
                error,
                ..
            } => {
                assert_eq!(frames_written, 5);
                assert!(error.is_none());
            }
            other => panic!("Expected RecorderFinished, got {:?}", other),
        }
        assert_eq!(progress.load(Ordering::Acquire), 5);

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.frame_slots(), 5);
        assert_eq!(reader.read_at(4).unwrap().sequence_number, 4);
    }

    #[test]
    fn test_write_failure_aborts_queue() {
        let queue = Arc::new(RecordingQueue::new(16, usize::MAX));
        for seq in 0..5 {
            queue.push(frame(seq)).unwrap();
        }
        let (report, _) = run_worker(
            Arc::clone(&queue),
            Box::new(FailingSink {
                fail_at: 2,
                seen: 0,
            }),
        );
        match report {
            WorkerReport::RecorderFinished {
                frames_written,
                error,
                ..
            } => {
                assert_eq!(frames_written, 2);
                assert!(error.unwrap().contains("No space left"));
            }
            other => panic!("Expected RecorderFinished, got {:?}", other),
        }
        assert!(queue.is_closed());
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_sequence_gap_is_a_failure() {
        let queue = Arc::new(RecordingQueue::new(16, usize::MAX));
        queue.push(frame(0)).unwrap();
        queue.push(frame(2)).unwrap();
        queue.close();
        let (report, _) = run_worker(
            queue,
            Box::new(FailingSink {
                fail_at: u64::MAX,
                seen: 0,
            }),
        );
        match report {
            WorkerReport::RecorderFinished {
                frames_written,
                error,
                ..
            } => {
                assert_eq!(frames_written, 1);
                assert!(error.unwrap().contains("sequence gap"));
            }
            other => panic!("Expected RecorderFinished, got {:?}", other),
        }
    }
}
