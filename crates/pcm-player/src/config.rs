//! Engine configuration.
//!
//! A [`PlayerConfig`] is fixed for the lifetime of a [`crate::engine::PcmPlayer`].
//! Hosts usually build one from defaults plus CLI/config-file overrides and call
//! [`PlayerConfig::validate`] before starting the engine.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::format::SampleEncoding;

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("channel count must be at least 1")]
    ZeroChannels,
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error("flush interval must be positive")]
    ZeroFlushInterval,
    #[error("queue bound must be a positive number of seconds, got {0}")]
    InvalidQueueBound(f32),
}

/// Stream format and scheduling parameters shared by feed/queue/scheduler stages.
///
/// Deserializes from a table where every key is optional; `flush_interval` is read from
/// `flush_interval_ms`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlayerConfig {
    /// Wire encoding of the raw chunks passed to `feed`.
    pub encoding: SampleEncoding,
    /// Interleaved channel count of the incoming stream.
    pub channels: u16,
    /// Stream sample rate in Hz.
    pub sample_rate: u32,
    /// Scheduler tick period.
    #[serde(with = "millis", rename = "flush_interval_ms")]
    pub flush_interval: Duration,
    /// Upper bound on audio waiting in the sample queue, in seconds.
    pub max_buffered_seconds: f32,
}

impl Default for PlayerConfig {
    /// Defaults match a mono 16-bit speech stream flushed every 100 ms.
    fn default() -> Self {
        Self {
            encoding: SampleEncoding::Int16,
            channels: 1,
            sample_rate: 22_050,
            flush_interval: Duration::from_millis(100),
            max_buffered_seconds: 30.0,
        }
    }
}

impl PlayerConfig {
    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::ZeroChannels);
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if !self.max_buffered_seconds.is_finite() || self.max_buffered_seconds <= 0.0 {
            return Err(ConfigError::InvalidQueueBound(self.max_buffered_seconds));
        }
        Ok(())
    }

    /// Channel count as a `usize` for indexing.
    pub fn channel_count(&self) -> usize {
        usize::from(self.channels)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = PlayerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.channel_count(), 1);
        assert_eq!(cfg.flush_interval, Duration::from_millis(100));
    }

    #[test]
    fn validate_rejects_zero_channels() {
        let cfg = PlayerConfig {
            channels: 0,
            ..PlayerConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroChannels));
    }

    #[test]
    fn validate_rejects_zero_rate_and_interval() {
        let cfg = PlayerConfig {
            sample_rate: 0,
            ..PlayerConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroSampleRate));

        let cfg = PlayerConfig {
            flush_interval: Duration::ZERO,
            ..PlayerConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroFlushInterval));
    }

    #[test]
    fn validate_rejects_bad_queue_bound() {
        for bad in [0.0, -1.0, f32::NAN, f32::INFINITY] {
            let cfg = PlayerConfig {
                max_buffered_seconds: bad,
                ..PlayerConfig::default()
            };
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::InvalidQueueBound(_))
            ));
        }
    }
}
