//! Byte sources feeding the player.
//!
//! Raw streams (files, pipes, sockets) hand out reads whose length has nothing to do with
//! the sample width. [`SampleAligner`] holds back the trailing partial sample of each read
//! so the player only ever sees whole samples.

use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pcm_player::{PcmPlayer, PlayerConfig};

/// How far ahead of real time a paced source may feed.
const PACE_LEAD: Duration = Duration::from_millis(500);

/// Splits a byte stream into chunks holding whole samples.
#[derive(Debug)]
pub struct SampleAligner {
    width: usize,
    pending: Vec<u8>,
}

impl SampleAligner {
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
            pending: Vec::new(),
        }
    }

    /// Append `bytes` and return the longest whole-sample prefix of everything held.
    pub fn push<'a>(&'a mut self, bytes: &'a [u8]) -> AlignedChunk<'a> {
        if self.pending.is_empty() {
            let whole = bytes.len() - bytes.len() % self.width;
            self.pending.extend_from_slice(&bytes[whole..]);
            return AlignedChunk::Borrowed(&bytes[..whole]);
        }
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() - self.pending.len() % self.width;
        let rest = self.pending.split_off(whole);
        AlignedChunk::Owned(std::mem::replace(&mut self.pending, rest))
    }

    /// Bytes held back waiting for the rest of their sample.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Whole-sample chunk produced by [`SampleAligner::push`].
pub enum AlignedChunk<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl AlignedChunk<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AlignedChunk::Borrowed(b) => b,
            AlignedChunk::Owned(v) => v,
        }
    }
}

/// Paces feeding so queued audio stays at most [`PACE_LEAD`] ahead of the wall clock.
struct Pacer {
    started: Instant,
    bytes_per_second: f64,
}

impl Pacer {
    fn new(config: &PlayerConfig) -> Self {
        let bytes_per_second = f64::from(config.sample_rate)
            * f64::from(config.channels)
            * config.encoding.sample_width() as f64;
        Self {
            started: Instant::now(),
            bytes_per_second,
        }
    }

    fn delay_after(&self, fed_bytes: u64) -> Duration {
        let fed = Duration::from_secs_f64(fed_bytes as f64 / self.bytes_per_second);
        fed.saturating_sub(self.started.elapsed() + PACE_LEAD)
    }
}

/// Read `reader` to the end in reads of up to `chunk_bytes`, feeding each aligned chunk.
///
/// Returns the number of bytes fed. Stops early when `cancel` is set or the player stops.
pub fn feed_reader<R: Read>(
    player: &PcmPlayer,
    mut reader: R,
    chunk_bytes: usize,
    pace: bool,
    cancel: &AtomicBool,
) -> Result<u64> {
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    let mut aligner = SampleAligner::new(player.config().encoding.sample_width());
    let pacer = pace.then(|| Pacer::new(player.config()));
    let mut fed = 0u64;

    while !cancel.load(Ordering::Relaxed) && !player.is_stopped() {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read pcm source"),
        };
        let chunk = aligner.push(&buf[..n]);
        let bytes = chunk.as_bytes();
        if !bytes.is_empty() {
            player.feed(bytes);
            fed += bytes.len() as u64;
        }

        if let Some(pacer) = &pacer {
            let delay = pacer.delay_after(fed);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }

    if aligner.pending() > 0 {
        tracing::warn!(
            bytes = aligner.pending(),
            "source ended mid-sample; dropping trailing bytes"
        );
    }
    Ok(fed)
}
