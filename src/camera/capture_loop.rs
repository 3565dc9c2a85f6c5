//! Background capture thread implementation.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::opener::CameraHandle;
use super::types::{CameraId, CaptureFrame};
use crate::queue::{PreviewQueue, QueueError, RecordingQueue};
use crate::recording::WorkerReport;

#[derive(Debug)]
struct TapState {
    queue: Option<Arc<RecordingQueue>>,
    closing: bool,
    worker_alive: bool,
}

/// What the capture worker should do with the frame it just read.
#[derive(Debug)]
pub enum TapPoll {
    /// Not recording
    Idle,
    /// Push the frame here
    Record(Arc<RecordingQueue>),
}

/// Switch between a capture worker and the session deciding whether frames
/// are recorded.
///
/// Only the capture worker closes the queue during a graceful stop, after the
/// frame it is handling has been pushed, so a stop never cuts a frame off.
/// If the worker is already gone the session closes it directly.
#[derive(Debug, Clone)]
pub struct RecordingTap {
    state: Arc<Mutex<TapState>>,
}

impl Default for RecordingTap {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TapState {
                queue: None,
                closing: false,
                worker_alive: true,
            })),
        }
    }
}

impl RecordingTap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start forwarding frames to `queue`.
    pub fn attach(&self, queue: Arc<RecordingQueue>) {
        let mut state = self.lock();
        if !state.worker_alive {
            queue.close();
        }
        state.queue = Some(queue);
        state.closing = false;
    }

    /// Called by the capture worker once per frame.
    pub fn poll(&self) -> TapPoll {
        let mut state = self.lock();
        if state.closing {
            state.closing = false;
            if let Some(queue) = state.queue.take() {
                queue.close();
            }
            return TapPoll::Idle;
        }
        match &state.queue {
            Some(queue) => TapPoll::Record(Arc::clone(queue)),
            None => TapPoll::Idle,
        }
    }

    /// Stop forwarding and let the queue drain.
    pub fn request_close(&self) {
        let mut state = self.lock();
        if state.worker_alive {
            state.closing = state.queue.is_some();
        } else if let Some(queue) = state.queue.take() {
            queue.close();
        }
    }

    /// Stop forwarding and discard whatever is queued.
    pub fn abort(&self) {
        let queue = {
            let mut state = self.lock();
            state.closing = false;
            state.queue.take()
        };
        if let Some(queue) = queue {
            queue.abort();
        }
    }

    /// Called by the capture worker as it exits.
    pub fn worker_exited(&self) {
        let mut state = self.lock();
        state.worker_alive = false;
        state.closing = false;
        if let Some(queue) = state.queue.take() {
            queue.close();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock().queue.is_some()
    }
}

/// Owns one camera handle and fans its frames out to the consumer queues.
pub struct CaptureWorker {
    camera: CameraId,
    handle: CameraHandle,
    preview: Arc<PreviewQueue>,
    tap: RecordingTap,
    stop: Arc<AtomicBool>,
    reports: Sender<WorkerReport>,
}

impl CaptureWorker {
    pub fn new(
        camera: CameraId,
        handle: CameraHandle,
        preview: Arc<PreviewQueue>,
        tap: RecordingTap,
        stop: Arc<AtomicBool>,
        reports: Sender<WorkerReport>,
    ) -> Self {
        Self {
            camera,
            handle,
            preview,
            tap,
            stop,
            reports,
        }
    }

    /// Run the loop on its own thread. The thread hands the camera handle
    /// back when it exits.
    pub fn spawn(self) -> io::Result<JoinHandle<CameraHandle>> {
        thread::Builder::new()
            .name(format!("capture-{}", self.camera))
            .spawn(move || self.run())
    }

    fn run(mut self) -> CameraHandle {
        log::info!("{}: capture started ({})", self.camera, self.handle.mode());
        let mut sequence: u64 = 0;
        let mut recording: Option<Arc<RecordingQueue>> = None;
        let mut refused = false;

        while !self.stop.load(Ordering::Acquire) {
            let raw = match self.handle.read_frame() {
                Ok(raw) => raw,
                Err(error) => {
                    log::error!("{}: capture failed: {}", self.camera, error);
                    let _ = self.reports.send(WorkerReport::CaptureFault {
                        camera: self.camera,
                        error,
                    });
                    break;
                }
            };
            let captured_at = Instant::now();

            let target = match self.tap.poll() {
                TapPoll::Idle => {
                    if recording.take().is_some() {
                        log::debug!("{}: recording tap closed after {} frames", self.camera, sequence);
                    }
                    None
                }
                TapPoll::Record(queue) => {
                    let is_new = !recording.as_ref().is_some_and(|q| Arc::ptr_eq(q, &queue));
                    if is_new {
                        sequence = 0;
                        refused = false;
                        recording = Some(Arc::clone(&queue));
                    }
                    Some(queue)
                }
            };

            let frame = CaptureFrame::from_raw(self.camera, sequence, captured_at, raw);
            self.preview.offer(frame.clone());

            match target {
                Some(queue) if !refused => match queue.push(frame) {
                    Ok(()) => sequence += 1,
                    Err(QueueError::Overflow {
                        queued_bytes,
                        ceiling,
                        ..
                    }) => {
                        log::error!(
                            "{}: recording queue overflow ({} bytes queued, ceiling {})",
                            self.camera,
                            queued_bytes,
                            ceiling
                        );
                        refused = true;
                        let _ = self.reports.send(WorkerReport::Overflow {
                            camera: self.camera,
                            queued_bytes,
                            ceiling,
                        });
                    }
                    Err(QueueError::Closed) => refused = true,
                },
                Some(_) => {}
                None => sequence += 1,
            }
        }

        self.tap.worker_exited();
        log::info!("{}: capture stopped", self.camera);
        self.handle
    }
}
