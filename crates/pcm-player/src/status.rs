//! Observable engine state.
//!
//! [`PlayerStatus`] is shared between the feeding side, the scheduler thread, and anyone
//! polling the engine. Everything is updated with relaxed atomics; a [`StatusSnapshot`]
//! is a best-effort point-in-time copy.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Scheduler lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    /// Waiting for the next tick.
    Idle,
    /// A tick is pulling and shaping queued samples.
    Draining,
    /// The last tick handed a buffer to the device.
    Scheduled,
    /// Terminal: torn down or the device went away.
    Stopped,
}

impl PlaybackState {
    fn to_u8(self) -> u8 {
        match self {
            PlaybackState::Idle => 0,
            PlaybackState::Draining => 1,
            PlaybackState::Scheduled => 2,
            PlaybackState::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PlaybackState::Idle,
            1 => PlaybackState::Draining,
            2 => PlaybackState::Scheduled,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Shared counters updated by the engine and scheduler.
#[derive(Debug)]
pub struct PlayerStatus {
    state: AtomicU8,
    /// Chunks dropped because their length was not a multiple of the sample width.
    pub format_errors: AtomicU64,
    /// Chunks dropped because the sample queue was full.
    pub overflow_chunks: AtomicU64,
    /// Chunks refused because the engine had already stopped.
    pub rejected_chunks: AtomicU64,
    /// Buffers accepted by the output sink.
    pub buffers_submitted: AtomicU64,
    /// Frames accepted by the output sink.
    pub frames_submitted: AtomicU64,
    /// Ticks where the cursor had fallen behind the device clock.
    pub catch_up_events: AtomicU64,
    /// Samples held back for the next tick because they did not complete a frame.
    pub carried_samples: AtomicU64,
    cursor_nanos: AtomicU64,
    device_nanos: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Default for PlayerStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Idle.to_u8()),
            format_errors: AtomicU64::new(0),
            overflow_chunks: AtomicU64::new(0),
            rejected_chunks: AtomicU64::new(0),
            buffers_submitted: AtomicU64::new(0),
            frames_submitted: AtomicU64::new(0),
            catch_up_events: AtomicU64::new(0),
            carried_samples: AtomicU64::new(0),
            cursor_nanos: AtomicU64::new(0),
            device_nanos: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }
}

/// Point-in-time copy of [`PlayerStatus`].
#[derive(Clone, Debug, PartialEq)]
pub struct StatusSnapshot {
    pub state: PlaybackState,
    pub queued_samples: usize,
    pub format_errors: u64,
    pub overflow_chunks: u64,
    pub rejected_chunks: u64,
    pub buffers_submitted: u64,
    pub frames_submitted: u64,
    pub catch_up_events: u64,
    pub carried_samples: u64,
    /// Scheduled start of the next buffer on the device clock.
    pub cursor: Duration,
    /// Device clock as of the last tick.
    pub device_time: Duration,
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    /// Audio already handed to the device that has not played yet.
    pub fn remaining(&self) -> Duration {
        self.cursor.saturating_sub(self.device_time)
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl PlayerStatus {
    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == PlaybackState::Stopped
    }

    /// Move to `state` unless already stopped. Returns `false` when the move was refused.
    pub fn set_state(&self, state: PlaybackState) -> bool {
        let next = state.to_u8();
        let stopped = PlaybackState::Stopped.to_u8();
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != stopped).then_some(next)
            })
            .is_ok()
    }

    /// Enter the terminal state. Returns `true` only for the call that performed the move.
    pub fn mark_stopped(&self) -> bool {
        self.state.swap(PlaybackState::Stopped.to_u8(), Ordering::AcqRel)
            != PlaybackState::Stopped.to_u8()
    }

    pub fn record_clock(&self, cursor: Duration, device_time: Duration) {
        self.cursor_nanos.store(nanos(cursor), Ordering::Relaxed);
        self.device_nanos.store(nanos(device_time), Ordering::Relaxed);
    }

    pub fn record_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    pub fn snapshot(&self, queued_samples: usize) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            queued_samples,
            format_errors: self.format_errors.load(Ordering::Relaxed),
            overflow_chunks: self.overflow_chunks.load(Ordering::Relaxed),
            rejected_chunks: self.rejected_chunks.load(Ordering::Relaxed),
            buffers_submitted: self.buffers_submitted.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            catch_up_events: self.catch_up_events.load(Ordering::Relaxed),
            carried_samples: self.carried_samples.load(Ordering::Relaxed),
            cursor: Duration::from_nanos(self.cursor_nanos.load(Ordering::Relaxed)),
            device_time: Duration::from_nanos(self.device_nanos.load(Ordering::Relaxed)),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
