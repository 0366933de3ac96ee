//! One-shot buffer resampling.
//!
//! Uses Rubato to convert a scheduled buffer from the stream rate to the output device
//! rate before it is handed to the output callback. Each buffer is resampled on its own:
//! buffers may be separated by gaps on the device timeline, so no filter state is carried
//! between them. Edge fades keep the buffer ends near zero, which hides the
//! zero-padded filter tails.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

const SINC_LEN: usize = 128;

/// Resample interleaved `input` from `from_hz` to `to_hz`, producing exactly `out_frames`
/// frames.
///
/// The first output frame corresponds to the first input frame. `out_frames` is normally
/// the input length scaled by `to_hz / from_hz`; the output is trimmed or zero-padded to it
/// so the caller decides where the buffer ends on the output timeline.
pub fn resample_interleaved(
    input: &[f32],
    channels: usize,
    from_hz: u32,
    to_hz: u32,
    out_frames: usize,
) -> Result<Vec<f32>> {
    let channels = channels.max(1);
    let frames = input.len() / channels;
    if frames == 0 || from_hz == to_hz || from_hz == 0 || to_hz == 0 {
        let mut out = input[..frames * channels].to_vec();
        out.resize(out_frames * channels, 0.0);
        return Ok(out);
    }

    let f_ratio = f64::from(to_hz) / f64::from(from_hz);
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: calculate_cutoff(SINC_LEN, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    // Zero padding flushes the filter so the tail of the buffer comes out.
    let chunk_in_frames = frames + SINC_LEN;
    let mut resampler: Box<dyn Resampler<f32>> = Box::new(
        Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            chunk_in_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| anyhow!("resampler init error: {e}"))?,
    );

    let mut padded = Vec::with_capacity(chunk_in_frames * channels);
    padded.extend_from_slice(&input[..frames * channels]);
    padded.resize(chunk_in_frames * channels, 0.0);

    let out_capacity_frames = (chunk_in_frames as f64 * f_ratio * 1.1).ceil() as usize + SINC_LEN;
    let mut out_interleaved = vec![0.0f32; out_capacity_frames * channels];

    let input_adapter = InterleavedSlice::new(&padded, channels, chunk_in_frames)
        .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
    let mut output_adapter =
        InterleavedSlice::new_mut(&mut out_interleaved, channels, out_capacity_frames)
            .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

    let indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len: None,
    };

    let (_nbr_in, nbr_out) = resampler
        .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
        .map_err(|e| anyhow!("resampler process error: {e}"))?;

    let want = out_frames;
    let delay = resampler.output_delay().min(nbr_out);
    let available = (nbr_out - delay).min(want);

    let mut out = Vec::with_capacity(want * channels);
    out.extend_from_slice(&out_interleaved[delay * channels..(delay + available) * channels]);
    out.resize(want * channels, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let input = [0.1, 0.2, 0.3, 0.4, 0.5];
        let out = resample_interleaved(&input, 2, 48_000, 48_000, 2).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn output_is_trimmed_or_padded_to_requested_frames() {
        let input = [0.1, 0.2, 0.3, 0.4];
        let out = resample_interleaved(&input, 1, 48_000, 48_000, 3).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
        let out = resample_interleaved(&input, 1, 48_000, 48_000, 5).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.0]);

        let input = vec![0.0f32; 2_000];
        for want in [4_353, 4_354] {
            let out = resample_interleaved(&input, 1, 22_050, 48_000, want).unwrap();
            assert_eq!(out.len(), want);
        }
    }

    #[test]
    fn upsampling_produces_requested_frame_count() {
        let input = vec![0.0f32; 2 * 800];
        let out = resample_interleaved(&input, 2, 8_000, 16_000, 1_600).unwrap();
        assert_eq!(out.len(), 2 * 1_600);
        assert!(out.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn constant_level_survives_resampling() {
        let input = vec![0.5f32; 4_000];
        let out = resample_interleaved(&input, 1, 22_050, 48_000, 8_707).unwrap();
        assert_eq!(out.len(), 8_707);
        let mid = out.len() / 2;
        for s in &out[mid - 100..mid + 100] {
            assert!((s - 0.5).abs() < 0.01, "{s}");
        }
    }
}
