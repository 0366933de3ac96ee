//! pcm-play: play raw PCM streams through the streaming player.
//!
//! ## Modes
//! - `play`: play a raw PCM file, or stdin when the path is `-`.
//! - `listen`: accept TCP connections one at a time and play the bytes each one sends.
//!
//! The stream format (encoding, channels, rate) is not carried in the bytes; it comes from
//! `--config` and the format flags.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pcm_play::{cli, config, runtime};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,pcm_play=info,pcm_player=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    let Some(cmd) = args.cmd.as_ref() else {
        anyhow::bail!("nothing to do: pass a subcommand (play, listen) or --list-devices");
    };
    let settings = config::resolve(&args)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
            tracing::info!("interrupt received; stopping (press again to force)");
        });
    }

    match cmd {
        cli::Command::Play {
            path,
            chunk_bytes,
            pace,
        } => runtime::run_play(&settings, path, *chunk_bytes, *pace, &cancel),
        cli::Command::Listen { bind } => runtime::run_listen(&settings, *bind, &cancel),
    }
}
