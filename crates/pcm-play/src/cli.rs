use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pcm_player::SampleEncoding;

#[derive(Parser, Debug)]
#[command(name = "pcm-play", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// TOML file with player settings (flags override it)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Sample encoding of the raw stream: int8, int16, int32 or float32
    #[arg(long)]
    pub encoding: Option<SampleEncoding>,

    /// Interleaved channel count of the raw stream
    #[arg(long)]
    pub channels: Option<u16>,

    /// Sample rate of the raw stream in Hz
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Scheduler flush interval in milliseconds
    #[arg(long)]
    pub flush_ms: Option<u64>,

    /// Maximum audio held in the sample queue, in seconds
    #[arg(long)]
    pub max_buffered_seconds: Option<f32>,

    /// Output volume multiplier (1.0 = unchanged)
    #[arg(long)]
    pub volume: Option<f32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play raw PCM from a file, or from stdin when the path is `-`
    Play {
        /// Path to a raw PCM file, or `-` for stdin
        path: PathBuf,

        /// Bytes per read handed to the player
        #[arg(long, default_value_t = 4096)]
        chunk_bytes: usize,

        /// Feed no faster than real time (keeps the schedule short)
        #[arg(long)]
        pace: bool,
    },

    /// Accept TCP connections and play raw PCM bytes as they arrive
    Listen {
        /// Bind address, e.g. 0.0.0.0:5557
        #[arg(default_value = "127.0.0.1:5557")]
        bind: SocketAddr,
    },
}
