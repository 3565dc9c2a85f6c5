//! The two frame queues between a capture worker and its consumers.
//!
//! [`PreviewQueue`] is lossy: it keeps the latest two frames and silently
//! discards older ones so the capture thread never waits on the display.
//! [`RecordingQueue`] is lossless: a full queue blocks the capture thread, and
//! a queue whose buffered bytes would pass the memory ceiling refuses the frame
//! so the session can fail loudly instead of dropping it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::camera::CaptureFrame;

/// Frames kept by a preview queue.
pub const PREVIEW_CAPACITY: usize = 2;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop-oldest queue feeding the preview.
#[derive(Debug, Default)]
pub struct PreviewQueue {
    frames: Mutex<VecDeque<CaptureFrame>>,
    dropped: AtomicU64,
}

impl PreviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a frame, discarding the oldest one if the queue is full. Never blocks
    /// beyond the queue's own short critical section.
    pub fn offer(&self, frame: CaptureFrame) {
        let mut frames = lock(&self.frames);
        while frames.len() >= PREVIEW_CAPACITY {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
    }

    /// Take the most recent frame and discard anything older.
    pub fn take_latest(&self) -> Option<CaptureFrame> {
        let mut frames = lock(&self.frames);
        let latest = frames.pop_back();
        let older = frames.len() as u64;
        if older > 0 {
            frames.clear();
            self.dropped.fetch_add(older, Ordering::Relaxed);
        }
        latest
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames discarded without being shown.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Why a frame was not accepted by a [`RecordingQueue`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Accepting the frame would pass the memory ceiling
    #[error("recording queue holds {queued_bytes} bytes; a {frame_bytes}-byte frame would exceed the {ceiling}-byte ceiling")]
    Overflow {
        queued_bytes: usize,
        frame_bytes: usize,
        ceiling: usize,
    },

    /// The consumer side is gone or the queue was shut
    #[error("recording queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct RecordingState {
    frames: VecDeque<CaptureFrame>,
    queued_bytes: usize,
    closed: bool,
    aborted: bool,
    high_water: usize,
}

/// Bounded FIFO between a capture worker and a recording worker.
#[derive(Debug)]
pub struct RecordingQueue {
    state: Mutex<RecordingState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    memory_ceiling: usize,
}

impl RecordingQueue {
    /// # Arguments
    /// * `capacity` - frames buffered before `push` blocks (at least 1)
    /// * `memory_ceiling` - bytes buffered before `push` fails with `Overflow`
    pub fn new(capacity: usize, memory_ceiling: usize) -> Self {
        Self {
            state: Mutex::new(RecordingState::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            memory_ceiling,
        }
    }

    /// Append a frame, blocking while the queue is at capacity.
    ///
    /// # Errors
    /// * `QueueError::Overflow` - buffered bytes would exceed the memory ceiling
    /// * `QueueError::Closed` - the queue was closed or aborted
    pub fn push(&self, frame: CaptureFrame) -> Result<(), QueueError> {
        let frame_bytes = frame.byte_len();
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.queued_bytes + frame_bytes > self.memory_ceiling {
                return Err(QueueError::Overflow {
                    queued_bytes: state.queued_bytes,
                    frame_bytes,
                    ceiling: self.memory_ceiling,
                });
            }
            if state.frames.len() < self.capacity {
                break;
            }
            state = self
                .not_full
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        state.queued_bytes += frame_bytes;
        state.frames.push_back(frame);
        state.high_water = state.high_water.max(state.frames.len());
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest frame, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained, or aborted.
    pub fn pop(&self) -> Option<CaptureFrame> {
        let mut state = lock(&self.state);
        loop {
            if state.aborted {
                return None;
            }
            if let Some(frame) = state.frames.pop_front() {
                state.queued_bytes -= frame.byte_len();
                drop(state);
                self.not_full.notify_one();
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting frames. Frames already queued are still handed out.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Stop both sides immediately and discard queued frames.
    pub fn abort(&self) {
        {
            let mut state = lock(&self.state);
            state.closed = true;
            state.aborted = true;
            state.frames.clear();
            state.queued_bytes = 0;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn depth(&self) -> usize {
        lock(&self.state).frames.len()
    }

    pub fn queued_bytes(&self) -> usize {
        lock(&self.state).queued_bytes
    }

    /// Deepest the queue has been.
    pub fn high_water(&self) -> usize {
        lock(&self.state).high_water
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn memory_ceiling(&self) -> usize {
        self.memory_ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraId, RawFrame};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn frame(seq: u64, bytes: usize) -> CaptureFrame {
        CaptureFrame::from_raw(
            CameraId::FIRST,
            seq,
            Instant::now(),
            RawFrame {
                width: bytes as u32,
                height: 1,
                data: vec![0; bytes],
            },
        )
    }

    #[test]
    fn test_preview_drops_oldest() {
        let q = PreviewQueue::new();
        for seq in 0..5 {
            q.offer(frame(seq, 3));
        }
        assert_eq!(q.len(), PREVIEW_CAPACITY);
        assert_eq!(q.dropped(), 3);
        assert_eq!(q.take_latest().map(|f| f.sequence_number), Some(4));
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 4);
        assert!(q.take_latest().is_none());
    }

    #[test]
    fn test_recording_is_fifo() {
        let q = RecordingQueue::new(8, 1024);
        for seq in 0..5 {
            q.push(frame(seq, 10)).unwrap();
        }
        assert_eq!(q.queued_bytes(), 50);
        q.close();
        let order: Vec<u64> = std::iter::from_fn(|| q.pop()).map(|f| f.sequence_number).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn test_recording_blocks_at_capacity() {
        let q = Arc::new(RecordingQueue::new(2, 1024));
        q.push(frame(0, 10)).unwrap();
        q.push(frame(1, 10)).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let start = Instant::now();
                q.push(frame(2, 10)).unwrap();
                start.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(q.depth(), 2);
        assert_eq!(q.pop().map(|f| f.sequence_number), Some(0));
        let waited = producer.join().unwrap();
        assert!(waited >= Duration::from_millis(80));
        assert_eq!(q.depth(), 2);
        assert_eq!(q.high_water(), 2);
    }

    #[test]
    fn test_recording_overflow_past_ceiling() {
        let q = RecordingQueue::new(100, 25);
        q.push(frame(0, 10)).unwrap();
        q.push(frame(1, 10)).unwrap();
        assert_eq!(
            q.push(frame(2, 10)),
            Err(QueueError::Overflow {
                queued_bytes: 20,
                frame_bytes: 10,
                ceiling: 25
            })
        );
        assert_eq!(q.depth(), 2);
    }

    #[test]
    fn test_close_drains_then_ends() {
        let q = RecordingQueue::new(4, 1024);
        q.push(frame(0, 1)).unwrap();
        q.close();
        assert_eq!(q.push(frame(1, 1)), Err(QueueError::Closed));
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_abort_wakes_blocked_producer_and_consumer() {
        let q = Arc::new(RecordingQueue::new(1, 1024));
        q.push(frame(0, 1)).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(frame(1, 1)))
        };
        thread::sleep(Duration::from_millis(50));
        q.abort();
        assert_eq!(producer.join().unwrap(), Err(QueueError::Closed));
        assert!(q.pop().is_none());
        assert_eq!(q.depth(), 0);

        let empty = Arc::new(RecordingQueue::new(1, 1024));
        let consumer = {
            let q = Arc::clone(&empty);
            thread::spawn(move || q.pop())
        };
        thread::sleep(Duration::from_millis(50));
        empty.abort();
        assert!(consumer.join().unwrap().is_none());
    }
}
