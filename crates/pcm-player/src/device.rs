//! Output device discovery and stream config selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing a stream config close to the incoming PCM stream

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Largest fixed callback buffer we ask for. Larger buffers make the device clock coarser.
const MAX_BUFFER_FRAMES: u32 = 2_048;

/// Pick the first output device whose name contains `needle` (case-insensitive),
/// or the host default device when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let mut devices = host.output_devices().context("No output devices")?;
        return devices
            .find(|d| {
                d.description()
                    .ok()
                    .map(|n| matches_device_name(&n.name(), needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }

    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

/// Choose an output config for a stream at `stream_rate` with `stream_channels` channels.
///
/// Ranking, most important first:
/// 1. the exact stream rate (no resampling needed)
/// 2. enough output channels to carry the stream without downmixing
/// 3. the rate closest to the stream rate
/// 4. `f32` output over integer formats
pub fn pick_output_config(
    device: &cpal::Device,
    stream_rate: u32,
    stream_channels: u16,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .context("query supported output configs")?
        .collect();

    let mut best: Option<(ConfigRank, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = clamp_rate(range.min_sample_rate(), range.max_sample_rate(), stream_rate);
        let rank = ConfigRank {
            exact_rate: rate == stream_rate,
            fits_channels: range.channels() >= stream_channels,
            rate_distance: rate.abs_diff(stream_rate),
            format_rank: sample_format_rank(range.sample_format()),
        };
        if best.as_ref().is_none_or(|(b, _)| rank.beats(b)) {
            best = Some((rank, range.with_sample_rate(rate)));
        }
    }

    best.map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Prefer a fixed, modest buffer size if the device advertises a range.
///
/// Returns `None` when the device only supports its default buffer size.
pub fn pick_buffer_size(config: &cpal::SupportedStreamConfig) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(fixed_buffer_frames(*min, *max)))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print available output devices to stdout.
///
/// This is intended for CLI UX (`--list-devices`) rather than structured output.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let devices = host.output_devices().context("No output devices")?;
    for (i, d) in devices.enumerate() {
        println!("#{i}: {}", d.description()?);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ConfigRank {
    exact_rate: bool,
    fits_channels: bool,
    rate_distance: u32,
    format_rank: u8,
}

impl ConfigRank {
    fn beats(&self, other: &ConfigRank) -> bool {
        if self.exact_rate != other.exact_rate {
            return self.exact_rate;
        }
        if self.fits_channels != other.fits_channels {
            return self.fits_channels;
        }
        if self.rate_distance != other.rate_distance {
            return self.rate_distance < other.rate_distance;
        }
        self.format_rank < other.format_rank
    }
}

fn clamp_rate(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn fixed_buffer_frames(min: u32, max: u32) -> u32 {
    MAX_BUFFER_FRAMES.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
