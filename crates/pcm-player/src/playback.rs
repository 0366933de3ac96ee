//! CPAL-backed [`OutputSink`].
//!
//! Builds a CPAL output stream and keeps a list of buffers scheduled against a
//! frame-counting device clock. The real-time callback:
//! - sums every pending buffer that overlaps the current callback window
//! - writes silence where nothing is scheduled (and counts it as underrun)
//! - converts `f32` samples to the device sample format
//! - retires buffers once fully rendered
//!
//! The device clock is the number of frames the callback has rendered, divided by the
//! device sample rate. Channel mapping and resampling to the device rate happen in
//! [`CpalSink::schedule`], off the real-time thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::device;
use crate::resample::resample_interleaved;
use crate::sink::{DeviceBuffer, DeviceError, OutputSink, frame_span, frames_to_duration};

/// Interleaved audio at the device rate/channel layout, waiting for its start frame.
struct PendingBuffer {
    start_frame: u64,
    samples: Vec<f32>,
}

impl PendingBuffer {
    fn end_frame(&self, channels: usize) -> u64 {
        self.start_frame + (self.samples.len() / channels) as u64
    }
}

/// State shared between the sink and its output callback.
struct SinkShared {
    pending: Mutex<Vec<PendingBuffer>>,
    rendered_frames: AtomicU64,
    underrun_frames: AtomicU64,
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl SinkShared {
    fn pending(&self) -> MutexGuard<'_, Vec<PendingBuffer>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_failed(&self, message: String) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
        self.failed.store(true, Ordering::Release);
    }

    fn failure(&self) -> Option<String> {
        if !self.failed.load(Ordering::Acquire) {
            return None;
        }
        let msg = self.failure.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(msg.unwrap_or_else(|| "stream error".to_string()))
    }
}

/// Output sink playing scheduled buffers through a CPAL stream.
pub struct CpalSink {
    stream: cpal::Stream,
    shared: Arc<SinkShared>,
    device_rate: u32,
    device_channels: usize,
    closed: bool,
}

impl CpalSink {
    /// Open `device` with a config suited to a `stream_rate` / `stream_channels` stream and
    /// start the output callback.
    pub fn open(device: &cpal::Device, stream_rate: u32, stream_channels: u16) -> Result<Self> {
        let config = device::pick_output_config(device, stream_rate, stream_channels)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&config) {
            stream_config.buffer_size = buf;
        }
        tracing::info!(
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            stream_rate_hz = stream_rate,
            output_rate_hz = stream_config.sample_rate,
            output_channels = stream_config.channels,
            sample_format = ?config.sample_format(),
            buffer_size = ?stream_config.buffer_size,
            "device output config"
        );
        if stream_config.sample_rate != stream_rate {
            tracing::info!(
                from_hz = stream_rate,
                to_hz = stream_config.sample_rate,
                "resampling"
            );
        }

        let shared = Arc::new(SinkShared {
            pending: Mutex::new(Vec::new()),
            rendered_frames: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
        });

        let stream = build_output_stream(device, &stream_config, config.sample_format(), &shared)?;
        stream.play().context("start output stream")?;

        Ok(Self {
            stream,
            shared,
            device_rate: stream_config.sample_rate,
            device_channels: usize::from(stream_config.channels).max(1),
            closed: false,
        })
    }

    /// Frames rendered as silence because nothing was scheduled.
    pub fn underrun_frames(&self) -> u64 {
        self.shared.underrun_frames.load(Ordering::Relaxed)
    }
}

impl OutputSink for CpalSink {
    fn schedule(&mut self, buffer: DeviceBuffer, start: Duration) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if let Some(msg) = self.shared.failure() {
            return Err(DeviceError::Unavailable(msg));
        }

        let pending = to_device_layout(buffer, start, self.device_rate, self.device_channels)?;
        let rendered = self.shared.rendered_frames.load(Ordering::Acquire);
        if pending.start_frame < rendered {
            tracing::debug!(
                late_frames = rendered - pending.start_frame,
                "buffer scheduled behind the output callback; head will be skipped"
            );
        }

        self.shared.pending().push(pending);
        Ok(())
    }

    fn device_now(&self) -> Duration {
        frames_to_duration(
            self.shared.rendered_frames.load(Ordering::Acquire),
            self.device_rate,
        )
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.pause() {
            tracing::debug!("pause on close failed: {e}");
        }
        self.shared.pending().clear();
        tracing::info!(
            underrun_frames = self.underrun_frames(),
            "output device released"
        );
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build a CPAL output stream rendering the shared pending list.
fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<SinkShared>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, shared),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, shared),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, shared),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, shared),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

/// Type-specialized stream builder for CPAL sample formats.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<SinkShared>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = usize::from(config.channels).max(1);
    let shared_cb = shared.clone();
    let shared_err = shared.clone();
    let mut mix: Vec<f32> = Vec::new();
    let mut covered: Vec<bool> = Vec::new();

    let err_fn = move |err: cpal::StreamError| {
        tracing::warn!("stream error: {err}");
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            shared_err.mark_failed(err.to_string());
        }
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            let base = shared_cb.rendered_frames.load(Ordering::Acquire);

            mix.clear();
            mix.resize(frames * channels_out, 0.0);
            covered.clear();
            covered.resize(frames, false);

            {
                let mut pending = shared_cb.pending();
                render_pending(&mut pending, base, channels_out, &mut mix, &mut covered);
            }

            let silent = covered.iter().filter(|c| !**c).count() as u64;
            if silent > 0 {
                shared_cb.underrun_frames.fetch_add(silent, Ordering::Relaxed);
            }

            for (out, s) in data.iter_mut().zip(mix.iter()) {
                *out = <T as cpal::Sample>::from_sample::<f32>(*s);
            }
            shared_cb
                .rendered_frames
                .store(base + frames as u64, Ordering::Release);
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Sum every pending buffer overlapping `[base, base + frames)` into `mix`, then drop
/// buffers that end inside the window.
fn render_pending(
    pending: &mut Vec<PendingBuffer>,
    base: u64,
    channels: usize,
    mix: &mut [f32],
    covered: &mut [bool],
) {
    let frames = covered.len() as u64;
    let window_end = base + frames;

    for buf in pending.iter() {
        let buf_end = buf.end_frame(channels);
        let from = buf.start_frame.max(base);
        let to = buf_end.min(window_end);
        if from >= to {
            continue;
        }
        for frame in from..to {
            let out_frame = (frame - base) as usize;
            let src_frame = (frame - buf.start_frame) as usize;
            let out = &mut mix[out_frame * channels..(out_frame + 1) * channels];
            let src = &buf.samples[src_frame * channels..(src_frame + 1) * channels];
            for (o, s) in out.iter_mut().zip(src) {
                *o += *s;
            }
            covered[out_frame] = true;
        }
    }

    pending.retain(|buf| buf.end_frame(channels) > window_end);
}

/// Convert a scheduled buffer to the device rate and channel layout.
///
/// The device-frame span comes from [`frame_span`], and the resampled audio is sized to
/// fill it exactly, so buffers scheduled back to back on the stream timeline are also
/// back to back on the device timeline.
fn to_device_layout(
    buffer: DeviceBuffer,
    start: Duration,
    device_rate: u32,
    device_channels: usize,
) -> Result<PendingBuffer, DeviceError> {
    let span = frame_span(start, buffer.duration(), device_rate);
    let out_frames = (span.end - span.start) as usize;
    let src_rate = buffer.sample_rate();
    let src_channels = buffer.channel_count().max(1);
    let interleaved = interleave(buffer.into_channels());
    let resampled =
        resample_interleaved(&interleaved, src_channels, src_rate, device_rate, out_frames)
            .map_err(|e| DeviceError::Unavailable(format!("{e:#}")))?;
    Ok(PendingBuffer {
        start_frame: span.start,
        samples: map_channels(&resampled, src_channels, device_channels),
    })
}

/// Interleave planar channels. All channels must have the same length.
fn interleave(channels: Vec<Vec<f32>>) -> Vec<f32> {
    let count = channels.len();
    let frames = channels.first().map(Vec::len).unwrap_or(0);
    let mut out = vec![0.0; frames * count];
    for (ch, data) in channels.iter().enumerate() {
        for (frame, s) in data.iter().enumerate() {
            out[frame * count + ch] = *s;
        }
    }
    out
}

/// Map interleaved `src` with `src_channels` to `dst_channels`.
///
/// Mapping rules:
/// - same layout: pass-through
/// - mono → anything: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: best-effort "clamp to available channels"
fn map_channels(src: &[f32], src_channels: usize, dst_channels: usize) -> Vec<f32> {
    if src_channels == dst_channels {
        return src.to_vec();
    }
    let frames = src.len() / src_channels;
    let mut out = Vec::with_capacity(frames * dst_channels);
    for frame in src.chunks_exact(src_channels) {
        for dst_ch in 0..dst_channels {
            let s = match (src_channels, dst_channels) {
                (1, _) => frame[0],
                (2, 1) => 0.5 * (frame[0] + frame[1]),
                _ => frame[dst_ch.min(src_channels - 1)],
            };
            out.push(s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_orders_frames() {
        let out = interleave(vec![vec![1.0, 2.0], vec![-1.0, -2.0]]);
        assert_eq!(out, vec![1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn map_channels_follows_layout_rules() {
        assert_eq!(map_channels(&[0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(map_channels(&[0.2, 0.4], 2, 1), vec![0.3]);
        assert_eq!(map_channels(&[1.0, 2.0], 2, 2), vec![1.0, 2.0]);
        assert_eq!(
            map_channels(&[1.0, 2.0, 3.0], 3, 4),
            vec![1.0, 2.0, 3.0, 3.0]
        );
        assert_eq!(map_channels(&[1.0, 2.0, 3.0], 3, 2), vec![1.0, 2.0]);
    }

    #[test]
    fn resampled_buffers_stay_back_to_back_on_the_device() {
        let first = Duration::from_millis(1_234);
        let mut start = first;
        let mut prev_end: Option<u64> = None;
        for _ in 0..12 {
            let mut buffer = DeviceBuffer::silent(1, 2_000, 22_050);
            buffer.channels_mut().for_each(|ch| ch.fill(0.25));
            let duration = buffer.duration();

            let pending = to_device_layout(buffer, start, 48_000, 2).unwrap();
            if let Some(end) = prev_end {
                assert_eq!(pending.start_frame, end, "buffers must neither overlap nor gap");
            }
            prev_end = Some(pending.end_frame(2));
            start += duration;
        }
        assert_eq!(prev_end, Some(frame_span(first, start - first, 48_000).end));
    }

    #[test]
    fn same_rate_layout_keeps_frame_count() {
        let buffer = DeviceBuffer::silent(2, 480, 48_000);
        let pending = to_device_layout(buffer, Duration::from_millis(10), 48_000, 2).unwrap();
        assert_eq!(pending.start_frame, 480);
        assert_eq!(pending.end_frame(2), 960);
    }

    #[test]
    fn render_places_buffers_at_their_start_frame() {
        let mut pending = vec![PendingBuffer {
            start_frame: 2,
            samples: vec![1.0, 1.0, 1.0],
        }];
        let mut mix = vec![0.0; 4];
        let mut covered = vec![false; 4];

        render_pending(&mut pending, 0, 1, &mut mix, &mut covered);
        assert_eq!(mix, vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(covered, vec![false, false, true, true]);
        assert_eq!(pending.len(), 1);

        let mut mix = vec![0.0; 4];
        let mut covered = vec![false; 4];
        render_pending(&mut pending, 4, 1, &mut mix, &mut covered);
        assert_eq!(mix, vec![1.0, 0.0, 0.0, 0.0]);
        assert!(pending.is_empty());
    }

    #[test]
    fn render_sums_overlapping_buffers_and_skips_late_heads() {
        let mut pending = vec![
            PendingBuffer {
                start_frame: 8,
                samples: vec![0.5, -0.5, 0.5, -0.5, 0.5, -0.5],
            },
            PendingBuffer {
                start_frame: 9,
                samples: vec![0.25, 0.25],
            },
        ];
        let mut mix = vec![0.0; 4];
        let mut covered = vec![false; 2];

        render_pending(&mut pending, 9, 2, &mut mix, &mut covered);
        assert_eq!(mix, vec![0.75, -0.25, 0.5, -0.5]);
        assert_eq!(covered, vec![true, true]);
        assert!(pending.is_empty());
    }
}
