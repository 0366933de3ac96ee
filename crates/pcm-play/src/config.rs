//! Player settings: TOML file merged with command-line overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use pcm_player::{PlayerConfig, SampleEncoding};
use serde::Deserialize;

use crate::cli::Args;

/// Optional settings file. Every field may be omitted.
///
/// ```toml
/// device = "USB DAC"
/// volume = 0.8
///
/// [stream]
/// encoding = "int16"
/// channels = 1
/// sample_rate = 22050
/// flush_interval_ms = 100
/// max_buffered_seconds = 30.0
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayConfigFile {
    #[serde(default)]
    pub stream: PlayerConfig,
    pub volume: Option<f32>,
    pub device: Option<String>,
}

impl PlayConfigFile {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<PlayConfigFile>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Fully resolved settings for one run.
#[derive(Clone, Debug)]
pub struct PlaySettings {
    pub player: PlayerConfig,
    pub volume: f32,
    pub device: Option<String>,
}

/// Resolve settings: flags override the file, the file overrides defaults.
pub fn resolve(args: &Args) -> Result<PlaySettings> {
    let file = match &args.config {
        Some(path) => PlayConfigFile::load(path)?,
        None => PlayConfigFile::default(),
    };
    let settings = merge(args, file);
    settings.player.validate()?;
    Ok(settings)
}

fn merge(args: &Args, file: PlayConfigFile) -> PlaySettings {
    let stream = file.stream;
    let player = PlayerConfig {
        encoding: args.encoding.unwrap_or(stream.encoding),
        channels: args.channels.unwrap_or(stream.channels),
        sample_rate: args.sample_rate.unwrap_or(stream.sample_rate),
        flush_interval: args
            .flush_ms
            .map(Duration::from_millis)
            .unwrap_or(stream.flush_interval),
        max_buffered_seconds: args
            .max_buffered_seconds
            .unwrap_or(stream.max_buffered_seconds),
    };
    PlaySettings {
        player,
        volume: args.volume.or(file.volume).unwrap_or(1.0),
        device: normalize_device_name(args.device.clone().or(file.device)),
    }
}

fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
