//! Periodic flush of queued samples onto the device timeline.
//!
//! Each [`PlaybackScheduler::tick`]:
//! - drains the [`SampleQueue`] (plus any samples carried from the previous tick)
//! - de-interleaves whole frames into a planar device buffer
//! - applies a short linear fade at both edges to hide chunk-boundary clicks
//! - reconciles the playback cursor with the device clock (catch up, never schedule in the past)
//! - applies the current gain and submits the buffer at the cursor
//! - advances the cursor by the buffer duration, so the next buffer starts where this one ends

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::PlayerConfig;
use crate::gain::GainControl;
use crate::queue::SampleQueue;
use crate::sink::{DeviceBuffer, OutputSink, frames_to_duration};
use crate::status::{PlaybackState, PlayerStatus};

/// Longest fade ramp, in frames.
pub const FADE_FRAMES: usize = 50;

/// What a single tick did.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// Nothing to play (or only a partial frame).
    Idle,
    /// A buffer was handed to the sink.
    Scheduled {
        start: Duration,
        frames: usize,
        duration: Duration,
    },
    /// The engine is stopped; the tick did nothing.
    Stopped,
}

/// Drains the queue and schedules gapless buffers on an [`OutputSink`].
pub struct PlaybackScheduler<S: OutputSink> {
    channels: usize,
    sample_rate: u32,
    queue: Arc<SampleQueue>,
    gain: GainControl,
    status: Arc<PlayerStatus>,
    sink: S,
    cursor: Duration,
    carry: Vec<f32>,
}

impl<S: OutputSink> PlaybackScheduler<S> {
    /// Create a scheduler whose cursor starts at the sink's current device time.
    pub fn new(
        config: &PlayerConfig,
        queue: Arc<SampleQueue>,
        gain: GainControl,
        status: Arc<PlayerStatus>,
        sink: S,
    ) -> Self {
        let cursor = sink.device_now();
        status.record_clock(cursor, cursor);
        Self {
            channels: config.channel_count().max(1),
            sample_rate: config.sample_rate,
            queue,
            gain,
            status,
            sink,
            cursor,
            carry: Vec::new(),
        }
    }

    /// Start time of the next buffer on the device clock.
    pub fn cursor(&self) -> Duration {
        self.cursor
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    /// Run one flush cycle.
    pub fn tick(&mut self) -> TickOutcome {
        if self.status.is_stopped() {
            return TickOutcome::Stopped;
        }

        let drained = self.queue.drain_all();
        if drained.is_empty() && self.carry.len() < self.channels {
            self.status.set_state(PlaybackState::Idle);
            return TickOutcome::Idle;
        }
        if !self.status.set_state(PlaybackState::Draining) {
            return TickOutcome::Stopped;
        }

        let mut samples = std::mem::take(&mut self.carry);
        samples.extend_from_slice(&drained);

        let frames = samples.len() / self.channels;
        let whole = frames * self.channels;
        if whole < samples.len() {
            self.carry = samples.split_off(whole);
        }
        self.status
            .carried_samples
            .store(self.carry.len() as u64, Ordering::Relaxed);

        if frames == 0 {
            self.status.set_state(PlaybackState::Idle);
            return TickOutcome::Idle;
        }

        let mut buffer = self
            .sink
            .allocate_buffer(self.channels, frames, self.sample_rate);
        deinterleave_into(&samples, &mut buffer);
        for channel in buffer.channels_mut() {
            apply_edge_fades(channel);
            self.gain.apply(channel);
        }

        let now = self.sink.device_now();
        if self.cursor < now {
            tracing::debug!(
                gap_ms = (now - self.cursor).as_secs_f64() * 1000.0,
                "playback fell behind device clock; catching up"
            );
            self.status.catch_up_events.fetch_add(1, Ordering::Relaxed);
            self.cursor = now;
        }

        let start = self.cursor;
        let duration = frames_to_duration(frames as u64, self.sample_rate);
        tracing::trace!(
            start_s = start.as_secs_f64(),
            device_s = now.as_secs_f64(),
            duration_s = duration.as_secs_f64(),
            frames,
            "scheduling buffer"
        );

        if let Err(e) = self.sink.schedule(buffer, start) {
            tracing::error!("output device failed, stopping playback: {e}");
            self.status.record_error(e.to_string());
            self.status.mark_stopped();
            self.carry.clear();
            return TickOutcome::Stopped;
        }

        self.cursor = start + duration;
        self.status.buffers_submitted.fetch_add(1, Ordering::Relaxed);
        self.status
            .frames_submitted
            .fetch_add(frames as u64, Ordering::Relaxed);
        self.status.record_clock(self.cursor, now);
        self.status.set_state(PlaybackState::Scheduled);

        TickOutcome::Scheduled {
            start,
            frames,
            duration,
        }
    }

    /// Refresh the published device time without scheduling anything.
    pub fn observe_clock(&self) {
        self.status.record_clock(self.cursor, self.sink.device_now());
    }

    /// Enter the terminal state and release the sink. Carried samples are dropped.
    pub fn shutdown(&mut self) {
        self.status.mark_stopped();
        self.carry.clear();
        self.status.carried_samples.store(0, Ordering::Relaxed);
        self.sink.close();
    }
}

/// Split interleaved `samples` into the planar `buffer`, whole frames only.
fn deinterleave_into(samples: &[f32], buffer: &mut DeviceBuffer) {
    let channels = buffer.channel_count();
    let frames = buffer.frames();
    for (ch, out) in buffer.channels_mut().enumerate() {
        for (frame, slot) in out.iter_mut().enumerate().take(frames) {
            *slot = samples[frame * channels + ch];
        }
    }
}

/// Linear fade-in over the first `F` frames and fade-out over the last `F` frames,
/// with `F = min(FADE_FRAMES, len / 2)`.
///
/// Frame `i` of the head is scaled by `i / F`; frame `k` of the tail region is scaled by
/// `(F - k) / F`, so the last frame ends at `1 / F`. On short buffers the two ramps
/// multiply where they meet.
pub fn apply_edge_fades(channel: &mut [f32]) {
    let len = channel.len();
    let fade = FADE_FRAMES.min(len / 2);
    if fade == 0 {
        return;
    }
    let f = fade as f32;

    for (i, s) in channel.iter_mut().take(fade).enumerate() {
        *s = *s * i as f32 / f;
    }
    for (k, s) in channel[len - fade..].iter_mut().enumerate() {
        *s = *s * (fade - k) as f32 / f;
    }
}
