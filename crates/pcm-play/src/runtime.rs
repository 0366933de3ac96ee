//! pcm-play runtime helpers.
//!
//! Provides device enumeration, file/stdin playback, and the TCP listener.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use pcm_player::{PcmPlayer, PlaybackState, StatusSnapshot, device};

use crate::config::PlaySettings;
use crate::source;

/// How many consecutive idle polls count as "finished playing".
const SETTLED_POLLS: u32 = 2;

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}

/// Open the configured device and start a player with the resolved settings.
fn open_player(settings: &PlaySettings) -> Result<PcmPlayer> {
    let player = PcmPlayer::open_default(settings.player.clone(), settings.device.clone())?;
    player.set_volume(settings.volume);
    Ok(player)
}

/// Play a raw PCM file, or stdin when `path` is `-`, then wait for it to finish.
pub fn run_play(
    settings: &PlaySettings,
    path: &Path,
    chunk_bytes: usize,
    pace: bool,
    cancel: &AtomicBool,
) -> Result<()> {
    let reader: Box<dyn Read> = if path.as_os_str() == "-" {
        Box::new(std::io::stdin().lock())
    } else {
        Box::new(std::fs::File::open(path).with_context(|| format!("open {:?}", path))?)
    };

    let player = open_player(settings)?;
    let fed = source::feed_reader(&player, reader, chunk_bytes, pace, cancel)?;
    tracing::info!(bytes = fed, "source finished; waiting for playback");
    let snapshot = wait_for_playback(&player, cancel);
    player.stop();
    log_summary(&snapshot);
    if let Some(err) = snapshot.last_error {
        anyhow::bail!("playback stopped: {err}");
    }
    Ok(())
}

/// Accept TCP clients one at a time and play the raw PCM bytes they send.
///
/// Each connection gets a fresh player; the connection's audio is allowed to drain
/// before the next client is accepted.
pub fn run_listen(settings: &PlaySettings, bind: SocketAddr, cancel: &AtomicBool) -> Result<()> {
    let listener = TcpListener::bind(bind).with_context(|| format!("bind {bind}"))?;
    listener
        .set_nonblocking(true)
        .context("set listener nonblocking")?;
    tracing::info!(bind = %bind, "listening (one client at a time)");

    while !cancel.load(Ordering::Relaxed) {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(settings.player.flush_interval);
                continue;
            }
            Err(e) => {
                tracing::warn!("accept error: {e}");
                continue;
            }
        };
        tracing::info!(peer = %peer, "client connected");
        if let Err(e) = serve_client(settings, stream, cancel) {
            tracing::warn!(peer = %peer, "client session error: {e:#}");
        }
        tracing::info!(peer = %peer, "client disconnected; ready for next connection");
    }
    Ok(())
}

fn serve_client(settings: &PlaySettings, stream: TcpStream, cancel: &AtomicBool) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("set client blocking")?;
    // Bounded reads so a silent client cannot hold off ctrl-c forever.
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .context("set client read timeout")?;
    let player = open_player(settings)?;
    let reader = TimeoutRetry {
        inner: stream,
        cancel,
    };
    let fed = source::feed_reader(&player, reader, 4096, false, cancel)?;
    tracing::info!(bytes = fed, "client stream ended; waiting for playback");
    let snapshot = wait_for_playback(&player, cancel);
    player.stop();
    log_summary(&snapshot);
    Ok(())
}

/// Turns read timeouts into retries until `cancel` is set.
struct TimeoutRetry<'a, R> {
    inner: R,
    cancel: &'a AtomicBool,
}

impl<R: Read> Read for TimeoutRetry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if self.cancel.load(Ordering::Relaxed) {
                        return Ok(0);
                    }
                }
                other => return other,
            }
        }
    }
}

/// Block until everything fed has played, the player stops, or `cancel` is set.
///
/// Polls the player's status once per flush interval.
pub fn wait_for_playback(player: &PcmPlayer, cancel: &AtomicBool) -> StatusSnapshot {
    let poll = player.config().flush_interval;
    let mut settled = 0;
    loop {
        let snapshot = player.status();
        if snapshot.state == PlaybackState::Stopped || cancel.load(Ordering::Relaxed) {
            return snapshot;
        }
        if is_drained(&snapshot) {
            settled += 1;
            if settled >= SETTLED_POLLS {
                return snapshot;
            }
        } else {
            settled = 0;
        }
        std::thread::sleep(poll);
    }
}

fn is_drained(snapshot: &StatusSnapshot) -> bool {
    snapshot.queued_samples == 0
        && snapshot.carried_samples == 0
        && snapshot.remaining() == Duration::ZERO
}

fn log_summary(snapshot: &StatusSnapshot) {
    tracing::info!(
        buffers = snapshot.buffers_submitted,
        frames = snapshot.frames_submitted,
        catch_ups = snapshot.catch_up_events,
        format_errors = snapshot.format_errors,
        overflow_chunks = snapshot.overflow_chunks,
        rejected_chunks = snapshot.rejected_chunks,
        "playback summary"
    );
}
