//! Output volume shared between the caller and the scheduler tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Runtime-adjustable output multiplier.
///
/// Cloning is cheap and every clone controls the same value. The scheduler samples the
/// multiplier once per tick, so a change never touches buffers that were already submitted.
#[derive(Clone, Debug)]
pub struct GainControl {
    bits: Arc<AtomicU32>,
}

impl GainControl {
    pub fn new(volume: f32) -> Self {
        let gain = Self {
            bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
        };
        gain.set_volume(volume);
        gain
    }

    /// Current multiplier.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    /// Set the multiplier. Negative and non-finite values are treated as silence.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.max(0.0) } else { 0.0 };
        self.bits.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Scale `samples` in place by the current multiplier.
    ///
    /// Returns the multiplier that was applied.
    pub fn apply(&self, samples: &mut [f32]) -> f32 {
        let volume = self.volume();
        if volume != 1.0 {
            for s in samples.iter_mut() {
                *s *= volume;
            }
        }
        volume
    }
}

impl Default for GainControl {
    fn default() -> Self {
        Self::new(1.0)
    }
}
