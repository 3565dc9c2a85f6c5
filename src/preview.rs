//! Live preview rendering at a fixed cadence.
//!
//! The worker never waits on a capture thread: each tick it takes whatever
//! the preview queues hold and moves on. Presentation itself is delegated to a
//! [`PreviewSink`] so a UI layer can subscribe without being called into from
//! capture threads.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::camera::{CameraId, CaptureFrame};
use crate::queue::PreviewQueue;

/// Tick times remembered by [`SharedPreview`].
const TICK_HISTORY: usize = 4096;

/// What to show for one camera.
#[derive(Debug, Clone)]
pub enum PreviewView {
    Frame(CaptureFrame),
    /// No fresh frame within the staleness threshold
    NoSignal,
}

/// Receives rendered preview views.
pub trait PreviewSink: Send {
    fn present(&mut self, camera: CameraId, view: PreviewView);

    /// Called once at the start of every tick.
    fn tick(&mut self, _at: Instant) {}
}

/// Preview cadence settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewOptions {
    /// Time between ticks
    pub interval: Duration,
    /// Age after which a camera shows "no signal"
    pub staleness: Duration,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(33),
            staleness: Duration::from_millis(500),
        }
    }
}

impl PreviewOptions {
    pub fn from_rate(fps: u32, staleness: Duration) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            staleness,
        }
    }
}

#[derive(Debug, Default)]
struct SharedState {
    latest: HashMap<CameraId, PreviewView>,
    presented: HashMap<CameraId, u64>,
    no_signal: HashMap<CameraId, u64>,
    ticks: VecDeque<Instant>,
}

/// A [`PreviewSink`] that keeps the latest view per camera for polling.
#[derive(Debug, Clone, Default)]
pub struct SharedPreview {
    state: Arc<Mutex<SharedState>>,
}

impl SharedPreview {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn latest(&self, camera: CameraId) -> Option<PreviewView> {
        self.lock().latest.get(&camera).cloned()
    }

    /// Frames shown for `camera`.
    pub fn presented(&self, camera: CameraId) -> u64 {
        self.lock().presented.get(&camera).copied().unwrap_or(0)
    }

    /// Times "no signal" was shown for `camera`.
    pub fn no_signal_count(&self, camera: CameraId) -> u64 {
        self.lock().no_signal.get(&camera).copied().unwrap_or(0)
    }

    /// Start times of recent ticks, oldest first.
    pub fn tick_times(&self) -> Vec<Instant> {
        self.lock().ticks.iter().copied().collect()
    }
}

impl PreviewSink for SharedPreview {
    fn present(&mut self, camera: CameraId, view: PreviewView) {
        let mut state = self.lock();
        let counter = match view {
            PreviewView::Frame(_) => &mut state.presented,
            PreviewView::NoSignal => &mut state.no_signal,
        };
        *counter.entry(camera).or_insert(0) += 1;
        state.latest.insert(camera, view);
    }

    fn tick(&mut self, at: Instant) {
        let mut state = self.lock();
        if state.ticks.len() >= TICK_HISTORY {
            state.ticks.pop_front();
        }
        state.ticks.push_back(at);
    }
}

struct CameraFeed {
    camera: CameraId,
    queue: Arc<PreviewQueue>,
    last_frame_at: Instant,
    showing_no_signal: bool,
}

/// Renders the newest frame of each camera on a fixed cadence.
pub struct PreviewWorker {
    feeds: Vec<CameraFeed>,
    sink: Box<dyn PreviewSink>,
    options: PreviewOptions,
    stop: Arc<AtomicBool>,
}

impl PreviewWorker {
    pub fn new(
        queues: Vec<(CameraId, Arc<PreviewQueue>)>,
        sink: Box<dyn PreviewSink>,
        options: PreviewOptions,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let now = Instant::now();
        let feeds = queues
            .into_iter()
            .map(|(camera, queue)| CameraFeed {
                camera,
                queue,
                last_frame_at: now,
                showing_no_signal: false,
            })
            .collect();
        Self {
            feeds,
            sink,
            options,
            stop,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("preview".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        log::debug!("Preview started ({:?} per tick)", self.options.interval);
        let mut next_tick = Instant::now();
        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            self.render_tick(now);

            next_tick += self.options.interval;
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                // Running late; don't try to catch up with a burst of ticks.
                next_tick = now;
            }
        }
        log::debug!("Preview stopped");
    }

    /// Render one tick for every camera.
    pub fn render_tick(&mut self, now: Instant) {
        self.sink.tick(now);
        let staleness = self.options.staleness;
        for feed in &mut self.feeds {
            let fresh = feed
                .queue
                .take_latest()
                .filter(|f| now.saturating_duration_since(f.capture_timestamp) <= staleness);

            match fresh {
                Some(frame) => {
                    feed.last_frame_at = frame.capture_timestamp;
                    feed.showing_no_signal = false;
                    self.sink.present(feed.camera, PreviewView::Frame(frame));
                }
                None => {
                    let stale = now.saturating_duration_since(feed.last_frame_at) > staleness;
                    if stale && !feed.showing_no_signal {
                        log::debug!("{}: no signal", feed.camera);
                        feed.showing_no_signal = true;
                        self.sink.present(feed.camera, PreviewView::NoSignal);
                    }
                }
            }
        }
    }
}
