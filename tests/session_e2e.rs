//! End-to-end tests for recording sessions.
//!
//! Sessions run on synthetic cameras and write into temporary directories:
//! - A normal recording yields two gapless files and a matching descriptor
//! - A stalled writer fails the session with a backpressure overflow
//! - A write error stops both cameras and flags the descriptor
//! - The preview keeps its cadence while the recording path is blocked

mod common;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dualcam_recorder::camera::synthetic::{frame_counter, Pacing};
use dualcam_recorder::camera::{
    CameraBackend, CameraId, Capability, CaptureFrame, PixelFormat, Resolution, SyntheticBackend,
};
use dualcam_recorder::recording::{
    ContainerReader, ContainerSinkFactory, FailureKind, FrameSink, RecordingSession,
    SessionDescriptor, SessionError, SessionEvent, SessionStatus, SinkFactory, StreamSpec,
};
use dualcam_recorder::{start_session, stop_session};
use tempfile::TempDir;

use common::{open_pair, options, small_mode, small_pair, wait_until, CAM_A, CAM_B};

/// Writes real containers, but slowly.
struct SlowSinkFactory {
    delay: Duration,
}

struct SlowSink {
    inner: Box<dyn FrameSink>,
    delay: Duration,
}

impl FrameSink for SlowSink {
    fn append(&mut self, frame: &CaptureFrame) -> io::Result<()> {
        thread::sleep(self.delay);
        self.inner.append(frame)
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        self.inner.finish()
    }
}

impl SinkFactory for SlowSinkFactory {
    fn create(&self, path: &Path, spec: &StreamSpec) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(SlowSink {
            inner: ContainerSinkFactory.create(path, spec)?,
            delay: self.delay,
        }))
    }
}

/// Fails every camera's writes after a number of frames, like a full disk.
struct FullDiskFactory {
    fail_after: u64,
}

struct FullDiskSink {
    inner: Box<dyn FrameSink>,
    written: u64,
    fail_after: u64,
}

impl FrameSink for FullDiskSink {
    fn append(&mut self, frame: &CaptureFrame) -> io::Result<()> {
        if self.written >= self.fail_after {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "No space left on device",
            ));
        }
        self.inner.append(frame)?;
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        self.inner.finish()
    }
}

impl SinkFactory for FullDiskFactory {
    fn create(&self, path: &Path, spec: &StreamSpec) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(FullDiskSink {
            inner: ContainerSinkFactory.create(path, spec)?,
            written: 0,
            fail_after: self.fail_after,
        }))
    }
}

fn assert_gapless(path: &Path, frame_count: u64) {
    let mut reader = ContainerReader::open(path).unwrap();
    assert_eq!(reader.frame_slots(), frame_count);

    let mut previous_counter = None;
    for i in 0..frame_count {
        let frame = reader.read_at(i).unwrap();
        assert_eq!(frame.frame_index, i);
        assert_eq!(frame.sequence_number, i);
        // Every frame the camera produced while recording made it to disk.
        let counter = frame_counter(&frame.pixels).unwrap();
        if let Some(previous) = previous_counter {
            assert_eq!(counter, previous + 1, "frame {} skipped a capture", i);
        }
        previous_counter = Some(counter);
    }
}

#[test]
fn test_records_90_frames_at_720p() {
    let dir = TempDir::new().unwrap();
    let backend: Arc<dyn CameraBackend> = Arc::new(SyntheticBackend::pair());
    let requested = Capability::new(1280, 720, 30, PixelFormat::Mjpeg);
    let handles = open_pair(backend, &requested);

    let mut session = start_session(handles, options(dir.path(), 32)).unwrap();
    assert_eq!(session.status(), SessionStatus::Recording);
    assert!(wait_until(Duration::from_secs(30), || {
        CameraId::PAIR
            .iter()
            .all(|&c| session.frames_recorded(c) >= 90)
    }));

    let outcome = stop_session(&mut session).unwrap();
    assert_eq!(session.status(), SessionStatus::Stopped);

    let descriptor = &outcome.descriptor;
    assert!(!descriptor.failed);
    assert!(descriptor.failure.is_none());
    assert_eq!(descriptor.cameras.len(), 2);
    assert_eq!(Some(descriptor.start_epoch), session.start_epoch());
    assert!(descriptor.stop_epoch >= descriptor.start_epoch);

    for camera in &descriptor.cameras {
        assert!(camera.frame_count >= 90, "{} frames", camera.frame_count);
        assert_eq!(camera.resolution, Resolution::HD);
        assert_eq!(camera.nominal_fps, 30.0);
        assert!(!camera.faulted);
        let path = descriptor.output_file(camera.camera_id).unwrap();
        assert!(path.exists());
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.frame_slots(), camera.frame_count);
        // Both files carry the session's start time.
        assert_eq!(reader.header().start_epoch, descriptor.start_epoch);
    }

    let loaded = SessionDescriptor::load(&outcome.descriptor_path).unwrap();
    assert_eq!(&loaded, descriptor);
}

#[test]
fn test_recorded_sequences_are_gapless() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(2));
    let handles = open_pair(backend, &small_mode());

    let mut session = start_session(handles, options(dir.path(), 8)).unwrap();
    assert!(wait_until(Duration::from_secs(20), || {
        CameraId::PAIR
            .iter()
            .all(|&c| session.frames_recorded(c) >= 200)
    }));
    let outcome = stop_session(&mut session).unwrap();

    for camera in &outcome.descriptor.cameras {
        let path = outcome.descriptor.output_file(camera.camera_id).unwrap();
        assert_gapless(&path, camera.frame_count);
    }
}

#[test]
fn test_stalled_writer_overflows() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(5));
    let handles = open_pair(backend, &small_mode());

    let frame_len = Resolution::new(320, 240).rgb_frame_len();
    let mut opts = options(dir.path(), 64);
    opts.memory_ceiling = frame_len * 4;
    opts.sink_factory = Arc::new(SlowSinkFactory {
        delay: Duration::from_millis(200),
    });

    let mut session = start_session(handles, opts).unwrap();
    assert!(session.wait_for_status(SessionStatus::Stopped, Duration::from_secs(10)));

    let err = stop_session(&mut session).unwrap_err();
    assert!(matches!(err, SessionError::BackpressureOverflow { .. }), "{}", err);

    let outcome = session.outcome().expect("descriptor is written on failure");
    assert!(outcome.descriptor.failed);
    let failure = outcome.descriptor.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::BackpressureOverflow);

    let loaded = SessionDescriptor::load(&outcome.descriptor_path).unwrap();
    assert!(loaded.failed);
    for camera in &loaded.cameras {
        let path = loaded.output_file(camera.camera_id).unwrap();
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.frame_slots(), camera.frame_count);
    }

    // Both cameras can be handed back after a failed session.
    assert!(session.close().is_ok());
}

#[test]
fn test_write_failure_stops_both_cameras() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(5));
    let handles = open_pair(backend, &small_mode());

    let mut opts = options(dir.path(), 16);
    opts.sink_factory = Arc::new(FullDiskFactory { fail_after: 10 });

    let mut session = RecordingSession::new(handles, opts);
    let events = session.subscribe();
    session.start_preview().unwrap();
    session.start_recording().unwrap();
    assert!(session.wait_for_status(SessionStatus::Stopped, Duration::from_secs(10)));

    match stop_session(&mut session) {
        Err(SessionError::WriteFailure { message, .. }) => {
            assert!(message.contains("No space left on device"), "{}", message)
        }
        other => panic!("Expected write failure, got {:?}", other),
    }

    let outcome = session.outcome().unwrap();
    assert!(outcome.descriptor.failed);
    assert_eq!(
        outcome.descriptor.failure.as_ref().unwrap().kind,
        FailureKind::WriteFailure
    );
    for camera in &outcome.descriptor.cameras {
        assert!(camera.frame_count <= 10);
        let path = outcome.descriptor.output_file(camera.camera_id).unwrap();
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.frame_slots(), camera.frame_count);
    }

    let events: Vec<SessionEvent> = events.try_iter().collect();
    let statuses: Vec<SessionStatus> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StatusChanged(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            SessionStatus::Previewing,
            SessionStatus::Recording,
            SessionStatus::Stopped
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Finished { failed: true })));
}

#[test]
fn test_preview_cadence_under_backpressure() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(5));
    let handles = open_pair(backend, &small_mode());

    // Capture blocks on a full recording queue almost all the time.
    let mut opts = options(dir.path(), 2);
    opts.sink_factory = Arc::new(SlowSinkFactory {
        delay: Duration::from_millis(100),
    });

    let mut session = start_session(handles, opts).unwrap();
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(session.status(), SessionStatus::Recording);

    let preview = session.preview().unwrap().clone();
    let ticks = preview.tick_times();
    assert!(ticks.len() >= 20, "only {} preview ticks", ticks.len());
    let worst = ticks
        .windows(2)
        .map(|w| w[1].duration_since(w[0]))
        .max()
        .unwrap();
    assert!(
        worst < Duration::from_millis(250),
        "preview stalled for {:?}",
        worst
    );
    assert!(preview.presented(CameraId::FIRST) > 0);
    assert!(preview.presented(CameraId::SECOND) > 0);

    let outcome = stop_session(&mut session).unwrap();
    assert!(!outcome.descriptor.failed);
}

#[test]
fn test_camera_fault_is_not_session_fatal() {
    let dir = TempDir::new().unwrap();
    let backend: Arc<dyn CameraBackend> = Arc::new(
        SyntheticBackend::new(vec![
            common::small_camera(0, CAM_A).fail_after(40),
            common::small_camera(2, CAM_B),
        ])
        .with_pacing(Pacing::Fixed(Duration::from_millis(5))),
    );
    let handles = open_pair(backend, &small_mode());

    let mut session = RecordingSession::new(handles, options(dir.path(), 16));
    let events = session.subscribe();
    session.start_preview().unwrap();
    session.start_recording().unwrap();

    let mut faulted_camera = None;
    while let Ok(event) = events.recv_timeout(Duration::from_secs(10)) {
        if let SessionEvent::CameraFault { camera, .. } = event {
            faulted_camera = Some(camera);
            break;
        }
    }
    assert_eq!(faulted_camera, Some(CameraId::FIRST));
    assert!(wait_until(Duration::from_secs(10), || {
        session.frames_recorded(CameraId::SECOND) >= 100
    }));
    assert_eq!(session.status(), SessionStatus::Recording);

    let outcome = stop_session(&mut session).unwrap();
    let descriptor = &outcome.descriptor;
    assert!(!descriptor.failed);
    let faulted = descriptor.camera(CameraId::FIRST).unwrap();
    assert!(faulted.faulted);
    assert!(faulted.frame_count <= 40);
    let healthy = descriptor.camera(CameraId::SECOND).unwrap();
    assert!(!healthy.faulted);
    assert!(healthy.frame_count >= 100);
    for camera in &descriptor.cameras {
        let path = descriptor.output_file(camera.camera_id).unwrap();
        assert_eq!(
            ContainerReader::open(&path).unwrap().frame_slots(),
            camera.frame_count
        );
    }
}

#[test]
fn test_invalid_transitions() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(5));
    let handles = open_pair(backend, &small_mode());

    let mut session = RecordingSession::new(handles, options(dir.path(), 8));
    assert!(matches!(
        session.start_recording(),
        Err(SessionError::InvalidTransition {
            status: SessionStatus::Idle,
            ..
        })
    ));
    assert!(matches!(
        session.stop(),
        Err(SessionError::InvalidTransition { .. })
    ));

    session.start_preview().unwrap();
    assert!(matches!(
        session.start_preview(),
        Err(SessionError::InvalidTransition {
            status: SessionStatus::Previewing,
            ..
        })
    ));
    // Previewing alone never creates a session directory.
    assert!(session.session_dir().is_none());
    assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);

    session.start_recording().unwrap();
    assert!(matches!(
        session.start_recording(),
        Err(SessionError::InvalidTransition {
            status: SessionStatus::Recording,
            ..
        })
    ));
    stop_session(&mut session).unwrap();
    assert!(matches!(
        session.start_recording(),
        Err(SessionError::InvalidTransition {
            status: SessionStatus::Stopped,
            ..
        })
    ));
}

#[test]
fn test_closed_session_returns_cameras_for_a_new_session() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(5));
    let handles = open_pair(backend, &small_mode());

    let mut first = start_session(handles, options(dir.path(), 8)).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        first.frames_recorded(CameraId::SECOND) >= 10
    }));
    let first_outcome = stop_session(&mut first).unwrap();
    let handles = first.close().unwrap();
    assert_eq!(handles[0].device().stable_id, first_outcome.descriptor.cameras[0].stable_id);

    let mut second = start_session(handles, options(dir.path(), 8)).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        second.frames_recorded(CameraId::FIRST) >= 10
    }));
    let second_outcome = stop_session(&mut second).unwrap();

    assert_ne!(
        first_outcome.descriptor.session_id,
        second_outcome.descriptor.session_id
    );
    assert_ne!(
        first_outcome.descriptor_path,
        second_outcome.descriptor_path
    );
}

#[test]
fn test_stop_drains_queued_frames() {
    let dir = TempDir::new().unwrap();
    let backend = small_pair(Duration::from_millis(2));
    let handles = open_pair(backend, &small_mode());

    // The writer lags, so frames are still queued when stop is requested.
    let mut opts = options(dir.path(), 32);
    opts.sink_factory = Arc::new(SlowSinkFactory {
        delay: Duration::from_millis(10),
    });
    let mut session = start_session(handles, opts).unwrap();
    thread::sleep(Duration::from_millis(300));
    let written_at_stop = session.frames_recorded(CameraId::FIRST);

    let outcome = stop_session(&mut session).unwrap();
    assert!(!outcome.descriptor.failed);
    let first = outcome.descriptor.camera(CameraId::FIRST).unwrap();
    assert!(first.frame_count > written_at_stop);

    for camera in &outcome.descriptor.cameras {
        let path = outcome.descriptor.output_file(camera.camera_id).unwrap();
        assert_gapless(&path, camera.frame_count);
    }
}
