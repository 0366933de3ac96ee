//! Engine lifecycle: feeding, the scheduler timer thread, and teardown.
//!
//! A [`PcmPlayer`] owns one timer thread. The thread opens the output sink, builds a
//! [`PlaybackScheduler`] whose cursor starts at the device time, and ticks it every
//! `flush_interval` until [`PcmPlayer::stop`] is called. Ticks run one after another on
//! that thread; an overrunning tick delays the next one instead of overlapping it.
//!
//! Callers feed raw bytes from any thread. Nothing here reports errors back through
//! `feed`: malformed chunks, queue overflow, and feeds after stop are counted in the
//! shared [`PlayerStatus`] and logged.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};

use crate::config::PlayerConfig;
use crate::device;
use crate::gain::GainControl;
use crate::playback::CpalSink;
use crate::queue::{FeedError, SampleQueue, calc_max_buffered_samples};
use crate::scheduler::{PlaybackScheduler, TickOutcome};
use crate::sink::OutputSink;
use crate::status::{PlaybackState, PlayerStatus, StatusSnapshot};

/// Streaming PCM player.
///
/// Dropping the player stops it.
pub struct PcmPlayer {
    config: PlayerConfig,
    queue: Arc<SampleQueue>,
    gain: GainControl,
    status: Arc<PlayerStatus>,
    stop_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PcmPlayer {
    /// Start a player on the default host, using the output device matching `device`
    /// (substring) or the default output device.
    pub fn open_default(config: PlayerConfig, device: Option<String>) -> Result<Self> {
        let rate = config.sample_rate;
        let channels = config.channels;
        Self::start(config, move || {
            let host = cpal::default_host();
            let device = device::pick_device(&host, device.as_deref())?;
            CpalSink::open(&device, rate, channels)
        })
    }

    /// Start a player on the sink produced by `open_sink`.
    ///
    /// `open_sink` runs on the timer thread, which then owns the sink for its whole life.
    /// Returns once the sink is open and the playback cursor is anchored to its clock.
    pub fn start<S, F>(config: PlayerConfig, open_sink: F) -> Result<Self>
    where
        S: OutputSink + 'static,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        config.validate().context("invalid player config")?;

        let capacity = calc_max_buffered_samples(
            config.sample_rate,
            config.channel_count(),
            config.max_buffered_seconds,
        );
        let queue = Arc::new(SampleQueue::new(capacity));
        let gain = GainControl::default();
        let status = Arc::new(PlayerStatus::default());

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let worker = {
            let config = config.clone();
            let queue = queue.clone();
            let gain = gain.clone();
            let status = status.clone();
            thread::Builder::new()
                .name("pcm-scheduler".to_string())
                .spawn(move || {
                    let sink = match open_sink() {
                        Ok(sink) => sink,
                        Err(e) => {
                            status.mark_stopped();
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let mut scheduler = PlaybackScheduler::new(&config, queue, gain, status, sink);
                    tracing::debug!(
                        cursor_s = scheduler.cursor().as_secs_f64(),
                        "playback cursor anchored"
                    );
                    let _ = ready_tx.send(Ok(()));
                    run_timer(&mut scheduler, config.flush_interval, &stop_rx);
                    scheduler.shutdown();
                })
                .context("spawn scheduler thread")?
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e.context("open output sink"));
            }
            Err(_) => {
                let _ = worker.join();
                return Err(anyhow!("scheduler thread exited during startup"));
            }
        }

        tracing::info!(
            encoding = %config.encoding,
            channels = config.channels,
            sample_rate_hz = config.sample_rate,
            flush_ms = config.flush_interval.as_millis() as u64,
            queue_capacity_samples = capacity,
            "pcm player started"
        );

        Ok(Self {
            config,
            queue,
            gain,
            status,
            stop_tx: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    /// Queue a raw chunk for playback.
    ///
    /// Chunks may be any size as long as they hold whole samples. Misaligned chunks, chunks
    /// that overflow the queue, and chunks fed after the player stopped are dropped whole.
    pub fn feed(&self, bytes: &[u8]) {
        if self.status.is_stopped() {
            self.status.rejected_chunks.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(len = bytes.len(), "player stopped; rejecting chunk");
            return;
        }

        let samples = match self.config.encoding.convert(bytes) {
            Ok(samples) => samples,
            Err(e) => {
                self.status.format_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(len = bytes.len(), "dropping chunk: {e}");
                return;
            }
        };

        match self.queue.feed(&samples) {
            Ok(()) => {}
            Err(FeedError::Full { .. }) => {
                self.status.overflow_chunks.fetch_add(1, Ordering::Relaxed);
            }
            // stop() closed the queue after the check above.
            Err(FeedError::Closed) => {
                self.status.rejected_chunks.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(len = bytes.len(), "player stopped; rejecting chunk");
            }
        }
    }

    /// Set the output multiplier used from the next scheduled buffer onward.
    pub fn set_volume(&self, volume: f32) {
        self.gain.set_volume(volume);
        tracing::debug!(volume = self.gain.volume(), "volume changed");
    }

    /// Shared handle to the output multiplier.
    pub fn gain(&self) -> GainControl {
        self.gain.clone()
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.status.is_stopped()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot(self.queue.len())
    }

    /// Halt the timer, release the output device, and drop pending samples.
    ///
    /// No further ticks run once this returns. Safe to call more than once.
    pub fn stop(&self) {
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = stop_tx {
            let _ = tx.try_send(());
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        if worker.join().is_err() {
            tracing::error!("scheduler thread panicked");
        }

        self.status.mark_stopped();
        let dropped = self.queue.close();
        tracing::info!(dropped_samples = dropped, "pcm player stopped");
    }
}

impl Drop for PcmPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tick `scheduler` every `interval` until a stop signal arrives or the sink fails.
fn run_timer<S: OutputSink>(
    scheduler: &mut PlaybackScheduler<S>,
    interval: Duration,
    stop_rx: &Receiver<()>,
) {
    let ticker = crossbeam_channel::tick(interval);
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => match scheduler.tick() {
                TickOutcome::Stopped => break,
                TickOutcome::Idle => scheduler.observe_clock(),
                TickOutcome::Scheduled { .. } => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;
    use crate::sink::DeviceError;
    use crate::sink::testing::SinkProbe;
    use std::time::Instant;

    fn config(flush_ms: u64) -> PlayerConfig {
        PlayerConfig {
            encoding: SampleEncoding::Int16,
            channels: 1,
            sample_rate: 22_050,
            flush_interval: Duration::from_millis(flush_ms),
            max_buffered_seconds: 30.0,
        }
    }

    fn start(cfg: PlayerConfig, probe: &SinkProbe) -> PcmPlayer {
        let sink = probe.sink();
        PcmPlayer::start(cfg, move || Ok(sink)).unwrap()
    }

    fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn first_tick_plays_everything_fed_before_it_at_initial_cursor() {
        let probe = SinkProbe::default();
        probe.set_now(Duration::from_millis(1_234));
        let player = start(config(100), &probe);

        let bytes: Vec<u8> = (0..2_000i16)
            .flat_map(|i| (i * 8).to_le_bytes())
            .collect();
        assert_eq!(bytes.len(), 4_000);
        player.feed(&bytes);

        assert!(wait_for(Duration::from_secs(2), || !probe.submissions().is_empty()));
        thread::sleep(Duration::from_millis(250));

        let subs = probe.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].buffer.frames(), 2_000);
        assert_eq!(subs[0].buffer.channel_count(), 1);
        assert_eq!(subs[0].start, Duration::from_millis(1_234));

        let status = player.status();
        assert_eq!(status.buffers_submitted, 1);
        assert_eq!(status.frames_submitted, 2_000);
        assert_eq!(status.queued_samples, 0);
    }

    #[test]
    fn stop_then_feed_never_submits() {
        let probe = SinkProbe::default();
        let player = start(config(50), &probe);

        player.stop();
        assert!(probe.is_closed());
        player.feed(&[0u8; 400]);
        thread::sleep(Duration::from_millis(200));

        assert!(probe.submissions().is_empty());
        let status = player.status();
        assert_eq!(status.state, PlaybackState::Stopped);
        assert_eq!(status.rejected_chunks, 1);
        assert_eq!(status.queued_samples, 0);

        player.stop();
    }

    #[test]
    fn stop_discards_pending_samples() {
        let probe = SinkProbe::default();
        let player = start(config(10_000), &probe);

        player.feed(&[0u8; 400]);
        assert_eq!(player.status().queued_samples, 200);
        player.stop();

        assert_eq!(player.status().queued_samples, 0);
        assert!(probe.submissions().is_empty());
    }

    #[test]
    fn feeds_racing_stop_leave_nothing_queued() {
        for _ in 0..20 {
            let probe = SinkProbe::default();
            let player = Arc::new(start(config(10_000), &probe));
            let feeders: Vec<_> = (0..4)
                .map(|_| {
                    let player = player.clone();
                    thread::spawn(move || {
                        for _ in 0..500 {
                            player.feed(&[0u8; 64]);
                        }
                    })
                })
                .collect();
            thread::yield_now();
            player.stop();
            for f in feeders {
                f.join().unwrap();
            }
            assert_eq!(player.status().queued_samples, 0);
            assert!(probe.submissions().is_empty());
        }
    }

    #[test]
    fn misaligned_chunk_is_counted_and_dropped() {
        let probe = SinkProbe::default();
        let player = start(config(10_000), &probe);

        player.feed(&[1, 2, 3]);
        let status = player.status();
        assert_eq!(status.format_errors, 1);
        assert_eq!(status.queued_samples, 0);

        player.feed(&[1, 2, 3, 4]);
        let status = player.status();
        assert_eq!(status.format_errors, 1);
        assert_eq!(status.queued_samples, 2);
    }

    #[test]
    fn queue_overflow_drops_whole_chunk() {
        let probe = SinkProbe::default();
        let cfg = PlayerConfig {
            flush_interval: Duration::from_secs(10),
            max_buffered_seconds: 0.01,
            ..config(10_000)
        };
        let player = start(cfg, &probe);

        // Capacity is ceil(22050 * 0.01) = 221 samples.
        player.feed(&[0u8; 400]);
        player.feed(&[0u8; 100]);
        let status = player.status();
        assert_eq!(status.queued_samples, 200);
        assert_eq!(status.overflow_chunks, 1);
    }

    #[test]
    fn device_failure_stops_player_and_rejects_feeds() {
        let probe = SinkProbe::default();
        probe.fail_next(DeviceError::Unavailable("unplugged".to_string()));
        let player = start(config(20), &probe);

        player.feed(&[0u8; 200]);
        assert!(wait_for(Duration::from_secs(2), || player.is_stopped()));
        assert!(wait_for(Duration::from_secs(2), || probe.is_closed()));

        player.feed(&[0u8; 200]);
        let status = player.status();
        assert_eq!(status.rejected_chunks, 1);
        assert_eq!(
            status.last_error.as_deref(),
            Some("output device unavailable: unplugged")
        );
        assert!(probe.submissions().is_empty());
    }

    #[test]
    fn volume_applies_to_later_buffers() {
        let probe = SinkProbe::default();
        let player = start(config(20), &probe);
        player.set_volume(0.5);
        assert_eq!(player.gain().volume(), 0.5);

        let bytes: Vec<u8> = std::iter::repeat_n(16_384i16.to_le_bytes(), 200)
            .flatten()
            .collect();
        player.feed(&bytes);
        assert!(wait_for(Duration::from_secs(2), || !probe.submissions().is_empty()));

        let subs = probe.submissions();
        assert_eq!(subs[0].buffer.channel(0)[100], 0.25);
    }

    #[test]
    fn failing_sink_open_is_reported() {
        let err = PcmPlayer::start(config(100), || -> Result<crate::sink::testing::RecordingSink> {
            Err(anyhow!("no device"))
        })
        .err()
        .unwrap();
        assert!(format!("{err:#}").contains("no device"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let probe = SinkProbe::default();
        let sink = probe.sink();
        let cfg = PlayerConfig {
            channels: 0,
            ..config(100)
        };
        assert!(PcmPlayer::start(cfg, move || Ok(sink)).is_err());
    }
}
