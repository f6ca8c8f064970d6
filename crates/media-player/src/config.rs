//! Player option sets.
//!
//! Plain values with defaults; only the named thresholds are interpreted by the
//! pipeline, everything else is passed through to collaborators untouched.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::PlayerError;
use crate::frame::{AudioDescriptor, PixelFormat, SampleFormat};

/// Top-level options for a player item or frame reader.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PlayerOptions {
    pub demuxer: DemuxerOptions,
    pub decoder: DecoderOptions,
    pub processor: ProcessorOptions,
    pub buffering: BufferingOptions,
    pub clock: ClockOptions,
}

/// Options handed to the source collaborator.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DemuxerOptions {
    /// Read-ahead hint for network sources, in bytes.
    pub read_hint_bytes: Option<u64>,
    /// Opaque key/value pairs forwarded to the source.
    pub extra: BTreeMap<String, String>,
}

/// Options for the decode stage and decoding engine.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DecoderOptions {
    /// Consecutive undecodable packets tolerated before the segment is failed.
    pub max_consecutive_errors: u32,
    /// Frames held back to restore presentation order for video tracks.
    pub video_reorder_depth: usize,
    /// Hint forwarded to engines that support hardware decoding.
    pub prefer_hardware: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 8,
            video_reorder_depth: 4,
            prefer_hardware: false,
        }
    }
}

/// Resampling filter used when scaling video.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScaleFilter {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

/// Options for the process stage.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Canonical output rate; overridden by the audio renderer when one is attached.
    pub sample_rate: u32,
    /// Canonical output channel count.
    pub channels: u16,
    /// Resampler input chunk in frames (higher => more latency, lower => more overhead).
    pub resample_chunk_frames: usize,
    /// Time-stretch analysis block in frames.
    pub stretch_block_frames: usize,
    /// Mixed amplitude above which the soft limiter starts compressing.
    pub mix_soft_knee: f32,
    /// Amplitude the soft limiter approaches but never reaches.
    pub mix_ceiling: f32,
    /// Target picture width; `None` keeps the decoded size.
    pub width: Option<u32>,
    /// Target picture height; `None` keeps the decoded size.
    pub height: Option<u32>,
    /// Pixel format delivered to the video renderer.
    pub pixel_format: PixelFormat,
    pub scale_filter: ScaleFilter,
    /// Length of synthesised silence blocks for padding, in frames.
    pub padding_block_frames: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            resample_chunk_frames: 1024,
            stretch_block_frames: 1024,
            mix_soft_knee: 0.8,
            mix_ceiling: 1.0,
            width: None,
            height: None,
            pixel_format: PixelFormat::Rgba8,
            scale_filter: ScaleFilter::Bilinear,
            padding_block_frames: 1024,
        }
    }
}

impl ProcessorOptions {
    /// Canonical renderer-side audio format.
    pub fn audio_format(&self) -> AudioDescriptor {
        AudioDescriptor::new(self.sample_rate, self.channels, SampleFormat::F32)
    }
}

/// Capacity gate thresholds for every queue kind.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BufferingOptions {
    /// Packet queue low watermark in bytes.
    pub packet_low_bytes: usize,
    /// Packet queue high watermark in bytes.
    pub packet_high_bytes: usize,
    /// Decoded frame queue low watermark, in frames (video) or sample frames / 1024 (audio).
    pub frame_low: usize,
    /// Decoded frame queue high watermark.
    pub frame_high: usize,
    /// Renderer-ready audio buffered ahead of the output, in seconds.
    pub output_audio_seconds: f32,
    /// Renderer-ready video frames buffered ahead of the output.
    pub output_video_frames: usize,
}

impl Default for BufferingOptions {
    fn default() -> Self {
        Self {
            packet_low_bytes: 256 * 1024,
            packet_high_bytes: 4 * 1024 * 1024,
            frame_low: 4,
            frame_high: 16,
            output_audio_seconds: 2.0,
            output_video_frames: 24,
        }
    }
}

/// Pacing and drift-correction tuning for the clock.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClockOptions {
    /// Video frames later than this (wall milliseconds) are dropped.
    pub drop_threshold_ms: u64,
    /// Frames due within this many milliseconds are presented immediately.
    pub wait_tolerance_ms: u64,
    /// Consecutive drops after which the clock forces a catch-up presentation.
    pub max_consecutive_drops: u32,
    /// EMA weight of each new drift sample, in `(0, 1]`.
    pub drift_smoothing: f64,
    /// Upper bound for `set_rate`.
    pub max_rate: f64,
}

impl Default for ClockOptions {
    fn default() -> Self {
        Self {
            drop_threshold_ms: 80,
            wait_tolerance_ms: 5,
            max_consecutive_drops: 8,
            drift_smoothing: 0.1,
            max_rate: 4.0,
        }
    }
}

impl PlayerOptions {
    /// Load options from a TOML file; missing keys keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read options {:?}", path))?;
        let opts = toml::from_str::<PlayerOptions>(&raw)
            .with_context(|| format!("parse options {:?}", path))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reject option combinations the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), PlayerError> {
        let fail = |msg: String| Err(PlayerError::Configuration(msg));
        let b = &self.buffering;
        if b.packet_high_bytes == 0 || b.packet_low_bytes >= b.packet_high_bytes {
            return fail(format!(
                "packet watermarks must satisfy low < high (low={}, high={})",
                b.packet_low_bytes, b.packet_high_bytes
            ));
        }
        if b.frame_high == 0 || b.frame_low >= b.frame_high {
            return fail(format!(
                "frame watermarks must satisfy low < high (low={}, high={})",
                b.frame_low, b.frame_high
            ));
        }
        if !(b.output_audio_seconds.is_finite() && b.output_audio_seconds > 0.0) {
            return fail("output_audio_seconds must be positive".into());
        }
        if b.output_video_frames == 0 {
            return fail("output_video_frames must be at least 1".into());
        }

        let p = &self.processor;
        if p.sample_rate == 0 || p.channels == 0 {
            return fail("canonical sample rate and channels must be non-zero".into());
        }
        if p.resample_chunk_frames == 0 || p.stretch_block_frames < 64 {
            return fail("resample chunk must be non-zero and stretch block at least 64".into());
        }
        if p.padding_block_frames == 0 {
            return fail("padding_block_frames must be non-zero".into());
        }
        if !(p.mix_ceiling > 0.0 && p.mix_soft_knee >= 0.0 && p.mix_soft_knee < p.mix_ceiling) {
            return fail(format!(
                "mixer needs 0 <= knee < ceiling (knee={}, ceiling={})",
                p.mix_soft_knee, p.mix_ceiling
            ));
        }
        if !p.pixel_format.is_packed() {
            return fail(format!(
                "renderer pixel format {:?} must be packed",
                p.pixel_format
            ));
        }
        if matches!(p.width, Some(0)) || matches!(p.height, Some(0)) {
            return fail("target video dimensions must be non-zero".into());
        }

        let c = &self.clock;
        if c.max_consecutive_drops == 0 {
            return fail("max_consecutive_drops must be at least 1".into());
        }
        if !(c.drift_smoothing > 0.0 && c.drift_smoothing <= 1.0) {
            return fail("drift_smoothing must be in (0, 1]".into());
        }
        if !(c.max_rate.is_finite() && c.max_rate >= 1.0) {
            return fail("max_rate must be at least 1.0".into());
        }
        if self.decoder.max_consecutive_errors == 0 {
            return fail("max_consecutive_errors must be at least 1".into());
        }
        Ok(())
    }
}
