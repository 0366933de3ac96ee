//! Output device seam.
//!
//! [`OutputSink`] is everything the scheduler needs from a device: per-channel buffers,
//! a monotonic clock, and timed submission. [`crate::playback::CpalSink`] is the real
//! implementation; tests drive the scheduler with a recording sink and a manual clock.

use std::ops::Range;
use std::time::Duration;

use thiserror::Error;

/// Output device failures. Any of these stops the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("output device closed")]
    Closed,
    #[error("output device unavailable: {0}")]
    Unavailable(String),
}

/// Planar audio buffer handed to a sink: one sample array per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl DeviceBuffer {
    /// Zero-filled buffer of `frames` frames for `channels` channels.
    pub fn silent(channels: usize, frames: usize, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]; channels],
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback length at the buffer's sample rate.
    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames() as u64, self.sample_rate)
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.channels[ch]
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        self.channels.iter_mut()
    }

    pub fn into_channels(self) -> Vec<Vec<f32>> {
        self.channels
    }
}

/// Exact duration of `frames` at `sample_rate`, rounded down to the nanosecond.
pub fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    let nanos = u128::from(frames) * 1_000_000_000 / u128::from(sample_rate);
    Duration::new(
        (nanos / 1_000_000_000) as u64,
        (nanos % 1_000_000_000) as u32,
    )
}

/// Nearest frame index for a device-clock time.
pub fn duration_to_frames(time: Duration, sample_rate: u32) -> u64 {
    let scaled = time.as_nanos() * u128::from(sample_rate) + 500_000_000;
    (scaled / 1_000_000_000) as u64
}

/// Frames `[start, end)` at `sample_rate` covered by audio of length `duration` that
/// starts at `start`.
///
/// Both ends are rounded the same way, so a buffer starting exactly where another one ends
/// begins on that buffer's end frame.
pub fn frame_span(start: Duration, duration: Duration, sample_rate: u32) -> Range<u64> {
    duration_to_frames(start, sample_rate)..duration_to_frames(start + duration, sample_rate)
}

/// Platform audio output as seen by the scheduler.
pub trait OutputSink {
    /// Allocate a writable per-channel buffer.
    fn allocate_buffer(&mut self, channels: usize, frames: usize, sample_rate: u32) -> DeviceBuffer {
        DeviceBuffer::silent(channels, frames, sample_rate)
    }

    /// Submit `buffer` to start playing at `start` on the device clock.
    ///
    /// Must not block on playback.
    fn schedule(&mut self, buffer: DeviceBuffer, start: Duration) -> Result<(), DeviceError>;

    /// Current device-clock reading. Monotonic and comparable with `start` values.
    fn device_now(&self) -> Duration;

    /// Release the device. Later submissions fail with [`DeviceError::Closed`].
    fn close(&mut self);
}

impl<S: OutputSink + ?Sized> OutputSink for Box<S> {
    fn allocate_buffer(&mut self, channels: usize, frames: usize, sample_rate: u32) -> DeviceBuffer {
        (**self).allocate_buffer(channels, frames, sample_rate)
    }

    fn schedule(&mut self, buffer: DeviceBuffer, start: Duration) -> Result<(), DeviceError> {
        (**self).schedule(buffer, start)
    }

    fn device_now(&self) -> Duration {
        (**self).device_now()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording sink with a hand-driven clock.

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{DeviceBuffer, DeviceError, OutputSink};

    #[derive(Clone, Debug)]
    pub(crate) struct Submission {
        pub start: Duration,
        pub buffer: DeviceBuffer,
    }

    #[derive(Default)]
    struct Shared {
        now: Duration,
        submissions: Vec<Submission>,
        fail_with: Option<DeviceError>,
        closed: bool,
    }

    /// Test handle shared with a [`RecordingSink`].
    #[derive(Clone, Default)]
    pub(crate) struct SinkProbe {
        shared: Arc<Mutex<Shared>>,
    }

    impl SinkProbe {
        pub fn set_now(&self, now: Duration) {
            self.shared.lock().unwrap().now = now;
        }

        pub fn fail_next(&self, err: DeviceError) {
            self.shared.lock().unwrap().fail_with = Some(err);
        }

        pub fn submissions(&self) -> Vec<Submission> {
            self.shared.lock().unwrap().submissions.clone()
        }

        pub fn is_closed(&self) -> bool {
            self.shared.lock().unwrap().closed
        }

        pub fn sink(&self) -> RecordingSink {
            RecordingSink {
                shared: self.shared.clone(),
            }
        }
    }

    pub(crate) struct RecordingSink {
        shared: Arc<Mutex<Shared>>,
    }

    impl OutputSink for RecordingSink {
        fn schedule(&mut self, buffer: DeviceBuffer, start: Duration) -> Result<(), DeviceError> {
            let mut g = self.shared.lock().unwrap();
            if g.closed {
                return Err(DeviceError::Closed);
            }
            if let Some(err) = g.fail_with.take() {
                return Err(err);
            }
            g.submissions.push(Submission { start, buffer });
            Ok(())
        }

        fn device_now(&self) -> Duration {
            self.shared.lock().unwrap().now
        }

        fn close(&mut self) {
            self.shared.lock().unwrap().closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_to_duration_is_exact_for_whole_rates() {
        assert_eq!(frames_to_duration(22_050, 22_050), Duration::from_secs(1));
        assert_eq!(frames_to_duration(2_000, 22_050), Duration::from_nanos(90_702_947));
        assert_eq!(frames_to_duration(480, 48_000), Duration::from_millis(10));
        assert_eq!(frames_to_duration(10, 0), Duration::ZERO);
    }

    #[test]
    fn duration_to_frames_rounds_to_nearest() {
        assert_eq!(duration_to_frames(Duration::from_millis(10), 48_000), 480);
        assert_eq!(duration_to_frames(Duration::from_nanos(90_702_947), 22_050), 2_000);
        assert_eq!(duration_to_frames(Duration::ZERO, 44_100), 0);
    }

    #[test]
    fn frame_spans_of_back_to_back_audio_share_boundaries() {
        let step = frames_to_duration(2_000, 22_050);
        let mut start = Duration::from_millis(1_234);
        let mut prev_end = None;
        for _ in 0..50 {
            let span = frame_span(start, step, 48_000);
            if let Some(end) = prev_end {
                assert_eq!(span.start, end);
            }
            assert!(span.end - span.start == 4_353 || span.end - span.start == 4_354);
            prev_end = Some(span.end);
            start += step;
        }
    }

    #[test]
    fn device_buffer_reports_shape() {
        let mut buf = DeviceBuffer::silent(2, 480, 48_000);
        assert_eq!(buf.channel_count(), 2);
        assert_eq!(buf.frames(), 480);
        assert_eq!(buf.duration(), Duration::from_millis(10));
        buf.channels_mut().nth(1).unwrap()[0] = 0.5;
        assert_eq!(buf.channel(1)[0], 0.5);
        assert_eq!(buf.channel(0)[0], 0.0);
    }
}
