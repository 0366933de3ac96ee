//! Thread-safe sample queue between the feeding context and the scheduler tick.
//!
//! Producers append normalized interleaved samples with [`SampleQueue::feed`]; the
//! scheduler takes everything at once with [`SampleQueue::drain_all`]. One mutex guards
//! the buffer and its closed flag, so an append can never interleave with a drain or
//! land after [`SampleQueue::close`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Why a feed was refused. Nothing is appended in either case.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FeedError {
    #[error("sample queue full: {queued} queued + {incoming} incoming > {capacity}")]
    Full {
        queued: usize,
        incoming: usize,
        capacity: usize,
    },
    #[error("sample queue closed")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    samples: Vec<f32>,
    closed: bool,
}

/// Mutex-guarded interleaved `f32` buffer.
///
/// ## Data model
/// Samples are stored **interleaved**:
/// `frame0[ch0], frame0[ch1], ..., frame1[ch0], frame1[ch1], ...`
///
/// The queue itself is frame-agnostic: it stores whatever sample counts producers feed.
/// Frame alignment is the scheduler's concern.
pub struct SampleQueue {
    inner: Mutex<QueueState>,
    max_buffered_samples: usize,
    full_warned_ms: AtomicU64,
}

/// Compute a queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// - If `buffer_seconds` is non-finite or `<= 0.0`, a 30 second fallback is used.
/// - The returned value is `ceil(rate_hz * buffer_seconds) * channels` (saturating).
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        f64::from(buffer_seconds)
    } else {
        30.0
    };

    let frames = (f64::from(rate_hz) * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SampleQueue {
    /// Create an empty queue holding at most `max_buffered_samples`.
    pub fn new(max_buffered_samples: usize) -> Self {
        Self {
            inner: Mutex::new(QueueState::default()),
            max_buffered_samples,
            full_warned_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current number of queued samples (best-effort snapshot).
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Append samples to the tail.
    ///
    /// The feed is all-or-nothing: if it does not fit, or the queue is closed, nothing
    /// is appended.
    pub fn feed(&self, samples: &[f32]) -> Result<(), FeedError> {
        let mut g = self.lock();
        if g.closed {
            return Err(FeedError::Closed);
        }
        if samples.is_empty() {
            return Ok(());
        }
        if g.samples.len().saturating_add(samples.len()) > self.max_buffered_samples {
            let err = FeedError::Full {
                queued: g.samples.len(),
                incoming: samples.len(),
                capacity: self.max_buffered_samples,
            };
            drop(g);
            self.warn_full(&err);
            return Err(err);
        }
        g.samples.extend_from_slice(samples);
        Ok(())
    }

    /// Remove and return the entire queued content, leaving the queue empty.
    pub fn drain_all(&self) -> Vec<f32> {
        std::mem::take(&mut self.lock().samples)
    }

    /// Refuse all later feeds and drop anything still queued.
    ///
    /// Returns the number of discarded samples.
    pub fn close(&self) -> usize {
        let mut g = self.lock();
        g.closed = true;
        std::mem::take(&mut g.samples).len()
    }

    fn warn_full(&self, err: &FeedError) {
        let FeedError::Full {
            queued,
            incoming,
            capacity,
        } = *err
        else {
            return;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_millis(0))
            .as_millis() as u64;
        let last = self.full_warned_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.full_warned_ms.store(now, Ordering::Relaxed);
            tracing::warn!(
                queued_samples = queued,
                incoming_samples = incoming,
                capacity_samples = capacity,
                "sample queue full; dropping chunk"
            );
        }
    }
}
