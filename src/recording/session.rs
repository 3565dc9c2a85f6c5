//! Recording session state machine.
//!
//! ```text
//! Idle -> Previewing -> Recording -> Stopping -> Stopped
//!                           |                      ^
//!                           +----------------------+  (write failure / overflow)
//! ```
//!
//! A session owns two camera handles for its whole life. Capture and preview
//! threads start with the preview; recording workers and a supervisor thread
//! start with the recording. The supervisor is the only place faults are
//! turned into state changes, so both cameras always stop together.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::descriptor::{
    CameraOutput, DescriptorError, FailureKind, FailureRecord, SessionDescriptor,
};
use super::worker::{
    ContainerSinkFactory, FrameSink, RecordingWorker, SinkFactory, StreamSpec, WorkerReport,
};
use crate::camera::{
    CameraDevice, CameraError, CameraHandle, CameraId, Capability, CaptureWorker, RecordingTap,
    Rotation,
};
use crate::preview::{PreviewOptions, PreviewSink, PreviewWorker, SharedPreview};
use crate::queue::{PreviewQueue, RecordingQueue};

/// Extension of per-camera output files.
pub const OUTPUT_EXTENSION: &str = "dcfr";

/// How often the supervisor checks that recording threads are still alive.
const SUPERVISOR_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Previewing,
    Recording,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Previewing => "previewing",
            SessionStatus::Recording => "recording",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Notifications for a presentation layer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    /// One camera's capture source failed
    CameraFault { camera: CameraId, error: CameraError },
    /// The descriptor has been written
    Finished { failed: bool },
}

/// A session-fatal condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionFault {
    #[error("Writing {camera} failed: {message}. Check free disk space and permissions of the output directory")]
    WriteFailure { camera: CameraId, message: String },

    #[error("{camera} recording queue reached its {ceiling}-byte memory ceiling with {queued_bytes} bytes pending; storage is too slow for the capture rate")]
    BackpressureOverflow {
        camera: CameraId,
        queued_bytes: usize,
        ceiling: usize,
    },
}

impl SessionFault {
    fn record(&self) -> FailureRecord {
        match self {
            SessionFault::WriteFailure { camera, .. } => FailureRecord {
                kind: FailureKind::WriteFailure,
                camera: *camera,
                message: self.to_string(),
            },
            SessionFault::BackpressureOverflow { camera, .. } => FailureRecord {
                kind: FailureKind::BackpressureOverflow,
                camera: *camera,
                message: self.to_string(),
            },
        }
    }
}

/// Errors returned by [`RecordingSession`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Cannot {action} while the session is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("Writing {camera} failed: {message}")]
    WriteFailure { camera: CameraId, message: String },

    #[error("Recording of {camera} overflowed its {ceiling}-byte memory ceiling; storage is too slow for the capture rate")]
    BackpressureOverflow { camera: CameraId, ceiling: usize },

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("Session I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),
}

impl From<SessionFault> for SessionError {
    fn from(fault: SessionFault) -> Self {
        match fault {
            SessionFault::WriteFailure { camera, message } => {
                SessionError::WriteFailure { camera, message }
            }
            SessionFault::BackpressureOverflow {
                camera, ceiling, ..
            } => SessionError::BackpressureOverflow { camera, ceiling },
        }
    }
}

/// Settings for a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Directory that receives one sub-directory per session
    pub output_root: PathBuf,
    /// Frames buffered per camera before capture blocks
    pub queue_capacity: usize,
    /// Bytes buffered per camera before the session fails
    pub memory_ceiling: usize,
    /// Rotation recorded for each camera, in camera order
    pub rotations: [Rotation; 2],
    pub preview: PreviewOptions,
    pub sink_factory: Arc<dyn SinkFactory>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("output_root", &self.output_root)
            .field("queue_capacity", &self.queue_capacity)
            .field("memory_ceiling", &self.memory_ceiling)
            .field("rotations", &self.rotations)
            .field("preview", &self.preview)
            .finish_non_exhaustive()
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            output_root: dirs::video_dir().unwrap_or_else(|| PathBuf::from(".")),
            queue_capacity: 256,
            memory_ceiling: 1 << 30,
            rotations: [Rotation::None; 2],
            preview: PreviewOptions::default(),
            sink_factory: Arc::new(ContainerSinkFactory),
        }
    }
}

impl SessionOptions {
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }
}

/// Result of a stopped session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub descriptor: SessionDescriptor,
    pub descriptor_path: PathBuf,
}

struct Shared {
    status: Mutex<SessionStatus>,
    status_changed: Condvar,
    subscribers: Mutex<Vec<Sender<SessionEvent>>>,
    fault: OnceLock<SessionFault>,
    outcome: OnceLock<SessionOutcome>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus::Idle),
            status_changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            fault: OnceLock::new(),
            outcome: OnceLock::new(),
        }
    }

    fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    fn emit(&self, event: SessionEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Move to `to` if the current status is one of `from`.
    fn transition(
        &self,
        action: &'static str,
        from: &[SessionStatus],
        to: SessionStatus,
    ) -> Result<(), SessionError> {
        {
            let mut status = lock(&self.status);
            if !from.contains(&status) {
                return Err(SessionError::InvalidTransition {
                    action,
                    status: *status,
                });
            }
            log::info!("Session {} -> {}", *status, to);
            *status = to;
        }
        self.status_changed.notify_all();
        self.emit(SessionEvent::StatusChanged(to));
        Ok(())
    }
}

/// Per-camera pieces owned by the session.
struct CameraSlot {
    id: CameraId,
    device: CameraDevice,
    mode: Capability,
    handle: Option<CameraHandle>,
    preview_queue: Arc<PreviewQueue>,
    tap: RecordingTap,
    capture_thread: Option<JoinHandle<CameraHandle>>,
    progress: Arc<AtomicU64>,
}

/// Output files opened for a recording that has not started yet.
struct RecordingPlan {
    session_dir: PathBuf,
    start_epoch: DateTime<Utc>,
    origin: Instant,
    sinks: Vec<Box<dyn FrameSink>>,
}

/// A dual-camera recording session.
pub struct RecordingSession {
    session_id: Uuid,
    options: SessionOptions,
    shared: Arc<Shared>,
    /// Stops capture and preview threads
    shutdown: Arc<AtomicBool>,
    slots: [CameraSlot; 2],
    reports_tx: Sender<WorkerReport>,
    reports_rx: Option<Receiver<WorkerReport>>,
    preview: Option<SharedPreview>,
    preview_thread: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<Result<(), SessionError>>>,
    session_dir: Option<PathBuf>,
    start_epoch: Option<DateTime<Utc>>,
}

impl fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSession")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .field("session_dir", &self.session_dir)
            .finish_non_exhaustive()
    }
}

/// File name of a camera's output inside the session directory.
pub fn output_file_name(camera: CameraId) -> String {
    format!("{}.{}", camera, OUTPUT_EXTENSION)
}

impl RecordingSession {
    /// Create an idle session over two open cameras, in camera order.
    pub fn new(handles: [CameraHandle; 2], options: SessionOptions) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel();
        let [first, second] = handles;
        let slot = |id: CameraId, handle: CameraHandle| CameraSlot {
            id,
            device: handle.device().clone(),
            mode: handle.mode().clone(),
            handle: Some(handle),
            preview_queue: Arc::new(PreviewQueue::new()),
            tap: RecordingTap::new(),
            capture_thread: None,
            progress: Arc::new(AtomicU64::new(0)),
        };
        Self {
            session_id: Uuid::new_v4(),
            options,
            shared: Arc::new(Shared::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            slots: [slot(CameraId::FIRST, first), slot(CameraId::SECOND, second)],
            reports_tx,
            reports_rx: Some(reports_rx),
            preview: None,
            preview_thread: None,
            supervisor: None,
            session_dir: None,
            start_epoch: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Receive status changes and faults from now on.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// The preview sink created by [`start_preview`](Self::start_preview).
    pub fn preview(&self) -> Option<&SharedPreview> {
        self.preview.as_ref()
    }

    /// Directory holding this session's files, once recording has started.
    pub fn session_dir(&self) -> Option<&Path> {
        self.session_dir.as_deref()
    }

    pub fn start_epoch(&self) -> Option<DateTime<Utc>> {
        self.start_epoch
    }

    /// Frames written so far for `camera`.
    pub fn frames_recorded(&self, camera: CameraId) -> u64 {
        self.slots
            .iter()
            .find(|s| s.id == camera)
            .map(|s| s.progress.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// The fatal fault that ended this session, if any.
    pub fn failure(&self) -> Option<SessionFault> {
        self.shared.fault.get().cloned()
    }

    /// The written descriptor, once the session is stopped.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.shared.outcome.get().cloned()
    }

    /// Block until the session reaches `target` or `timeout` passes.
    pub fn wait_for_status(&self, target: SessionStatus, timeout: Duration) -> bool {
        let status = lock(&self.shared.status);
        let (status, _) = self
            .shared
            .status_changed
            .wait_timeout_while(status, timeout, |s| *s != target)
            .unwrap_or_else(PoisonError::into_inner);
        *status == target
    }

    /// Start capturing with the built-in [`SharedPreview`] sink.
    pub fn start_preview(&mut self) -> Result<(), SessionError> {
        let sink = SharedPreview::new();
        self.start_preview_with(Box::new(sink.clone()))?;
        self.preview = Some(sink);
        Ok(())
    }

    /// `Idle -> Previewing`: start both capture threads and the preview thread.
    pub fn start_preview_with(&mut self, sink: Box<dyn PreviewSink>) -> Result<(), SessionError> {
        let status = self.status();
        if status != SessionStatus::Idle || self.slots.iter().any(|s| s.handle.is_none()) {
            return Err(SessionError::InvalidTransition {
                action: "start preview",
                status,
            });
        }

        for slot in &mut self.slots {
            let Some(handle) = slot.handle.take() else {
                continue;
            };
            let worker = CaptureWorker::new(
                slot.id,
                handle,
                Arc::clone(&slot.preview_queue),
                slot.tap.clone(),
                Arc::clone(&self.shutdown),
                self.reports_tx.clone(),
            );
            slot.capture_thread = Some(worker.spawn()?);
        }

        let queues = self
            .slots
            .iter()
            .map(|s| (s.id, Arc::clone(&s.preview_queue)))
            .collect();
        let preview = PreviewWorker::new(
            queues,
            sink,
            self.options.preview,
            Arc::clone(&self.shutdown),
        );
        self.preview_thread = Some(preview.spawn()?);

        self.shared
            .transition("start preview", &[SessionStatus::Idle], SessionStatus::Previewing)
    }

    /// `Previewing -> Recording`.
    ///
    /// Records the start epoch, creates the session directory and both output
    /// files, and switches the capture threads to forwarding frames. Sequence
    /// numbers restart at 0.
    ///
    /// # Errors
    /// * `SessionError::Camera` - a camera failed while previewing
    /// * `SessionError::Io` - the session directory or an output file could
    ///   not be created; the session stays in `Previewing`
    pub fn start_recording(&mut self) -> Result<(), SessionError> {
        let status = self.status();
        let reports = match self.reports_rx.take() {
            Some(rx) if status == SessionStatus::Previewing => rx,
            other => {
                self.reports_rx = other;
                return Err(SessionError::InvalidTransition {
                    action: "start recording",
                    status,
                });
            }
        };

        // Refuse to record from a camera that already died.
        while let Ok(report) = reports.try_recv() {
            if let WorkerReport::CaptureFault { camera, error } = report {
                log::error!("Cannot start recording: {} failed: {}", camera, error);
                self.shared.emit(SessionEvent::CameraFault {
                    camera,
                    error: error.clone(),
                });
                self.reports_rx = Some(reports);
                return Err(SessionError::Camera(error));
            }
        }

        let plan = match self.open_outputs() {
            Ok(plan) => plan,
            Err(e) => {
                self.reports_rx = Some(reports);
                return Err(e);
            }
        };
        let RecordingPlan {
            session_dir,
            start_epoch,
            origin,
            sinks,
        } = plan;
        let (queues, recorders) = match self.spawn_recorders(sinks) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.reports_rx = Some(reports);
                return Err(e);
            }
        };

        let outputs = self
            .slots
            .iter()
            .zip(self.options.rotations)
            .map(|(slot, rotation)| CameraOutput {
                camera_id: slot.id,
                stable_id: slot.device.stable_id.clone(),
                device_name: slot.device.name().to_string(),
                output_path: PathBuf::from(output_file_name(slot.id)),
                frame_count: 0,
                resolution: slot.mode.resolution,
                nominal_fps: slot.mode.fps as f64,
                rotation,
                faulted: false,
            })
            .collect();
        let supervisor = Supervisor {
            session_id: self.session_id,
            shared: Arc::clone(&self.shared),
            shutdown: Arc::clone(&self.shutdown),
            reports,
            recorders,
            taps: self.slots.iter().map(|s| s.tap.clone()).collect(),
            progress: self.slots.iter().map(|s| Arc::clone(&s.progress)).collect(),
            session_dir: session_dir.clone(),
            start_epoch,
            origin,
            outputs,
        };

        if let Err(e) = self.shared.transition(
            "start recording",
            &[SessionStatus::Previewing],
            SessionStatus::Recording,
        ) {
            queues.iter().for_each(|q| q.close());
            return Err(e);
        }
        self.session_dir = Some(session_dir);
        self.start_epoch = Some(start_epoch);
        log::info!(
            "Recording session {} started at {}",
            self.session_id,
            start_epoch.to_rfc3339()
        );

        for (slot, queue) in self.slots.iter().zip(queues) {
            slot.tap.attach(queue);
        }

        let spawned = thread::Builder::new()
            .name("session-supervisor".to_string())
            .spawn(move || supervisor.run());
        match spawned {
            Ok(handle) => {
                self.supervisor = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::error!("Cannot start session supervisor: {}", e);
                for slot in &self.slots {
                    slot.tap.abort();
                }
                let _ = self.shared.transition(
                    "abort",
                    &[SessionStatus::Recording],
                    SessionStatus::Stopped,
                );
                Err(e.into())
            }
        }
    }

    fn open_outputs(&self) -> Result<RecordingPlan, SessionError> {
        // Microseconds, the precision the container headers keep.
        let start_epoch = Utc::now().trunc_subsecs(6);
        let origin = Instant::now();
        let short_id = self.session_id.simple().to_string();
        let dir_name = format!(
            "session_{}_{}",
            start_epoch.format("%Y%m%d_%H%M%S"),
            &short_id[..8]
        );
        std::fs::create_dir_all(&self.options.output_root)?;
        let session_dir = self.options.output_root.join(dir_name);
        std::fs::create_dir(&session_dir)?;

        let mut sinks = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let path = session_dir.join(output_file_name(slot.id));
            let spec = StreamSpec {
                camera_id: slot.id,
                resolution: slot.mode.resolution,
                nominal_fps: slot.mode.fps as f64,
                origin,
                start_epoch,
            };
            let sink = self.options.sink_factory.create(&path, &spec).map_err(|e| {
                log::error!("Cannot create {}: {}", path.display(), e);
                e
            })?;
            sinks.push(sink);
        }

        Ok(RecordingPlan {
            session_dir,
            start_epoch,
            origin,
            sinks,
        })
    }

    /// Start one recording worker per camera, each on a fresh queue.
    #[allow(clippy::type_complexity)]
    fn spawn_recorders(
        &self,
        sinks: Vec<Box<dyn FrameSink>>,
    ) -> Result<(Vec<Arc<RecordingQueue>>, Vec<(CameraId, JoinHandle<()>)>), SessionError> {
        let mut queues: Vec<Arc<RecordingQueue>> = Vec::with_capacity(self.slots.len());
        let mut recorders = Vec::with_capacity(self.slots.len());
        for (slot, sink) in self.slots.iter().zip(sinks) {
            slot.progress.store(0, Ordering::Release);
            let queue = Arc::new(RecordingQueue::new(
                self.options.queue_capacity,
                self.options.memory_ceiling,
            ));
            let worker = RecordingWorker::new(
                slot.id,
                Arc::clone(&queue),
                sink,
                Arc::clone(&slot.progress),
                self.reports_tx.clone(),
            );
            match worker.spawn() {
                Ok(handle) => recorders.push((slot.id, handle)),
                Err(e) => {
                    queues.iter().for_each(|q| q.close());
                    return Err(e.into());
                }
            }
            queues.push(queue);
        }
        Ok((queues, recorders))
    }

    /// `Recording -> Stopping -> Stopped`.
    ///
    /// Stops forwarding frames, waits until both recorders have written every
    /// queued frame, then stops the capture threads. Also collects the result
    /// of a session that already ended on a fault.
    ///
    /// # Errors
    /// * `SessionError::WriteFailure` / `BackpressureOverflow` - the session
    ///   ended on a fault; the descriptor is still written and flagged
    /// * `SessionError::InvalidTransition` - recording never started
    pub fn stop(&mut self) -> Result<SessionOutcome, SessionError> {
        let status = self.status();
        match status {
            SessionStatus::Recording => {
                if self
                    .shared
                    .transition("stop", &[SessionStatus::Recording], SessionStatus::Stopping)
                    .is_ok()
                {
                    for slot in &self.slots {
                        slot.tap.request_close();
                    }
                }
            }
            SessionStatus::Stopping | SessionStatus::Stopped => {}
            SessionStatus::Idle | SessionStatus::Previewing => {
                return Err(SessionError::InvalidTransition {
                    action: "stop",
                    status,
                });
            }
        }

        let supervised = match self.supervisor.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(SessionError::WorkerPanicked("supervisor"))),
            None => Ok(()),
        };
        self.join_workers();
        supervised?;

        if let Some(fault) = self.failure() {
            return Err(fault.into());
        }
        self.outcome().ok_or(SessionError::InvalidTransition {
            action: "stop",
            status: self.status(),
        })
    }

    fn join_workers(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for slot in &mut self.slots {
            if let Some(thread) = slot.capture_thread.take() {
                match thread.join() {
                    Ok(handle) => slot.handle = Some(handle),
                    Err(_) => log::error!("{}: capture thread panicked", slot.id),
                }
            }
        }
        if let Some(thread) = self.preview_thread.take() {
            if thread.join().is_err() {
                log::error!("Preview thread panicked");
            }
        }
    }

    /// Stop everything and hand the cameras back, in camera order.
    ///
    /// A recording still in progress is stopped first; its outcome stays
    /// available on disk.
    pub fn close(mut self) -> Result<[CameraHandle; 2], SessionError> {
        if self.supervisor.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Session {} ended with an error: {}", self.session_id, e);
            }
        }
        self.join_workers();
        let [first, second] = &mut self.slots;
        match (first.handle.take(), second.handle.take()) {
            (Some(a), Some(b)) => Ok([a, b]),
            _ => Err(SessionError::WorkerPanicked("capture")),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            if let Err(e) = self.stop() {
                log::warn!("Session {} ended with an error: {}", self.session_id, e);
            }
        }
        self.join_workers();
    }
}

/// Watches worker reports while recording and finalizes the session.
struct Supervisor {
    session_id: Uuid,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    reports: Receiver<WorkerReport>,
    recorders: Vec<(CameraId, JoinHandle<()>)>,
    taps: Vec<RecordingTap>,
    progress: Vec<Arc<AtomicU64>>,
    session_dir: PathBuf,
    start_epoch: DateTime<Utc>,
    origin: Instant,
    outputs: Vec<CameraOutput>,
}

impl Supervisor {
    fn run(mut self) -> Result<(), SessionError> {
        let mut finished: Vec<(CameraId, u64)> = Vec::new();

        while finished.len() < self.recorders.len() {
            match self.reports.recv_timeout(SUPERVISOR_POLL) {
                Ok(report) => self.handle(report, &mut finished),
                Err(RecvTimeoutError::Timeout) => self.reap_dead_recorders(&mut finished),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for (camera, handle) in std::mem::take(&mut self.recorders) {
            if handle.join().is_err() {
                log::error!("{}: recording thread panicked", camera);
            }
        }

        let stop_epoch = Utc::now();
        let fault = self.shared.fault.get().cloned();
        for output in &mut self.outputs {
            if let Some((_, count)) = finished.iter().find(|(c, _)| *c == output.camera_id) {
                output.frame_count = *count;
            }
        }
        let descriptor = SessionDescriptor {
            session_id: self.session_id,
            start_epoch: self.start_epoch,
            stop_epoch,
            duration_secs: self.origin.elapsed().as_secs_f64(),
            failed: fault.is_some(),
            failure: fault.as_ref().map(SessionFault::record),
            cameras: std::mem::take(&mut self.outputs),
            session_dir: self.session_dir.clone(),
        };

        let written = descriptor.write(&self.session_dir);
        if let Ok(path) = &written {
            log::info!(
                "Session {} descriptor written to {}",
                self.session_id,
                path.display()
            );
            let _ = self.shared.outcome.set(SessionOutcome {
                descriptor,
                descriptor_path: path.clone(),
            });
        }

        let _ = self.shared.transition(
            "finish",
            &[SessionStatus::Recording, SessionStatus::Stopping],
            SessionStatus::Stopped,
        );
        self.shutdown.store(true, Ordering::Release);
        self.shared.emit(SessionEvent::Finished {
            failed: fault.is_some(),
        });

        written.map(|_| ()).map_err(SessionError::from)
    }

    fn handle(&mut self, report: WorkerReport, finished: &mut Vec<(CameraId, u64)>) {
        match report {
            WorkerReport::CaptureFault { camera, error } => {
                log::warn!(
                    "{} stopped capturing during recording: {}; its file ends here",
                    camera,
                    error
                );
                if let Some(output) = self.outputs.iter_mut().find(|o| o.camera_id == camera) {
                    output.faulted = true;
                }
                self.shared
                    .emit(SessionEvent::CameraFault { camera, error });
            }
            WorkerReport::Overflow {
                camera,
                queued_bytes,
                ceiling,
            } => self.fail(SessionFault::BackpressureOverflow {
                camera,
                queued_bytes,
                ceiling,
            }),
            WorkerReport::RecorderFinished {
                camera,
                frames_written,
                error,
            } => {
                if let Some(message) = error {
                    self.fail(SessionFault::WriteFailure { camera, message });
                }
                if !finished.iter().any(|(c, _)| *c == camera) {
                    finished.push((camera, frames_written));
                }
            }
        }
    }

    /// Account for recorders that exited without reporting.
    fn reap_dead_recorders(&mut self, finished: &mut Vec<(CameraId, u64)>) {
        let dead: Vec<(usize, CameraId)> = self
            .recorders
            .iter()
            .enumerate()
            .filter(|(_, (camera, handle))| {
                handle.is_finished() && !finished.iter().any(|(c, _)| c == camera)
            })
            .map(|(i, (camera, _))| (i, *camera))
            .collect();
        if dead.is_empty() {
            return;
        }

        // A report sent just before the thread ended may still be queued.
        while let Ok(report) = self.reports.try_recv() {
            self.handle(report, finished);
        }
        for (i, camera) in dead {
            if finished.iter().any(|(c, _)| *c == camera) {
                continue;
            }
            let written = self.progress[i].load(Ordering::Acquire);
            self.fail(SessionFault::WriteFailure {
                camera,
                message: "recording thread exited unexpectedly".to_string(),
            });
            finished.push((camera, written));
        }
    }

    /// Record the first fatal fault and stop both cameras' recordings.
    fn fail(&self, fault: SessionFault) {
        if self.shared.fault.set(fault.clone()).is_ok() {
            log::error!("Session {} failed: {}", self.session_id, fault);
            for tap in &self.taps {
                tap.abort();
            }
        }
    }
}
