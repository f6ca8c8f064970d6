use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Player options file (TOML); missing keys keep their defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play one or more URLs back to back as a single timeline
    Play {
        /// Source URLs (`file://`, plain paths or `synth://`)
        #[arg(required = true)]
        urls: Vec<String>,

        /// Silence inserted between consecutive URLs, in seconds
        #[arg(long, default_value_t = 0.0)]
        gap: f64,

        /// Playback rate
        #[arg(long, default_value_t = 1.0)]
        rate: f64,

        /// Start position in seconds
        #[arg(long)]
        start: Option<f64>,

        /// Output volume in [0, 1]
        #[arg(long, default_value_t = 1.0)]
        volume: f32,

        /// Use a specific output device by substring match
        #[arg(long)]
        device: Option<String>,

        /// Preferred output sample rate; the device's best rate when unset
        #[arg(long)]
        sample_rate: Option<u32>,

        /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
        #[arg(long)]
        chunk_frames: Option<usize>,

        /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
        #[arg(long, default_value_t = 4096)]
        refill_max_frames: usize,

        /// Renderer-ready audio buffered ahead of the device, in seconds
        #[arg(long)]
        buffer_seconds: Option<f32>,
    },

    /// Resolve URLs and print their segments and tracks as JSON
    Probe {
        #[arg(required = true)]
        urls: Vec<String>,
    },
}
