//! Streaming PCM playback engine.
//!
//! Raw PCM chunks of any size are converted to normalized `f32` samples
//! ([`format`]), queued ([`queue`]), and flushed on a fixed timer by the
//! [`scheduler`] onto an [`sink::OutputSink`] as gapless, edge-faded buffers.
//! [`engine::PcmPlayer`] ties the stages together and owns the timer thread;
//! [`playback::CpalSink`] is the CPAL device backend.

pub mod config;
pub mod device;
pub mod engine;
pub mod format;
pub mod gain;
pub mod playback;
pub mod queue;
pub mod resample;
pub mod scheduler;
pub mod sink;
pub mod status;

pub use config::{ConfigError, PlayerConfig};
pub use engine::PcmPlayer;
pub use format::{FormatError, SampleEncoding};
pub use gain::GainControl;
pub use sink::{DeviceBuffer, DeviceError, OutputSink};
pub use status::{PlaybackState, StatusSnapshot};
