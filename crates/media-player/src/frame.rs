//! Packets and decoded frames.
//!
//! Ownership moves stage to stage: the demuxer creates a [`Packet`], the decode stage
//! consumes it and creates [`Frame`]s, the process stage consumes those and creates
//! renderer-ready frames. Nothing is mutated across a stage boundary.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::queue::Weighted;
use crate::time::MediaTime;
use crate::track::TrackId;

/// Sample storage format of decoded audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    U8,
    I16,
    I32,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
        }
    }
}

/// Audio stream format. Samples are always interleaved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDescriptor {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl AudioDescriptor {
    pub fn new(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }
}

impl fmt::Display for AudioDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {:?}",
            self.sample_rate, self.channels, self.format
        )
    }
}

/// Pixel layout of decoded video.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb24,
    Gray8,
    /// Planar Y, then quarter-size U and V.
    Yuv420p,
}

impl PixelFormat {
    /// Bytes needed for one `width`×`height` image.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => w * h * 4,
            PixelFormat::Rgb24 => w * h * 3,
            PixelFormat::Gray8 => w * h,
            PixelFormat::Yuv420p => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    pub fn is_packed(self) -> bool {
        !matches!(self, PixelFormat::Yuv420p)
    }
}

/// Video stream format.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoDescriptor {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: Option<f64>,
}

impl VideoDescriptor {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
            frame_rate: None,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

impl fmt::Display for VideoDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.pixel_format)
    }
}

/// Compressed data unit for one track.
#[derive(Clone, Debug)]
pub struct Packet {
    pub track: TrackId,
    pub dts: MediaTime,
    pub pts: MediaTime,
    pub duration: MediaTime,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl Weighted for Packet {
    fn cost(&self) -> usize {
        self.data.len().max(1)
    }
}

/// Interleaved decoded samples in their native storage format.
#[derive(Clone, Debug, PartialEq)]
pub enum AudioSamples {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
}

impl AudioSamples {
    pub fn len(&self) -> usize {
        match self {
            AudioSamples::U8(v) => v.len(),
            AudioSamples::I16(v) => v.len(),
            AudioSamples::I32(v) => v.len(),
            AudioSamples::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            AudioSamples::U8(_) => SampleFormat::U8,
            AudioSamples::I16(_) => SampleFormat::I16,
            AudioSamples::I32(_) => SampleFormat::I32,
            AudioSamples::F32(_) => SampleFormat::F32,
        }
    }

    /// Normalise to `f32` in `[-1.0, 1.0]`.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            AudioSamples::U8(v) => v.iter().map(|&s| (s as f32 - 128.0) / 128.0).collect(),
            AudioSamples::I16(v) => v.iter().map(|&s| s as f32 / 32_768.0).collect(),
            AudioSamples::I32(v) => v.iter().map(|&s| s as f32 / 2_147_483_648.0).collect(),
            AudioSamples::F32(v) => v.clone(),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            AudioSamples::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Decoded or processed audio.
#[derive(Clone, Debug)]
pub struct AudioFrame {
    pub pts: MediaTime,
    /// Wall-clock playing time of the samples.
    pub duration: MediaTime,
    pub descriptor: AudioDescriptor,
    pub samples: AudioSamples,
    /// Content advanced per second of playback (time-stretch factor applied).
    pub rate: f64,
}

impl AudioFrame {
    pub fn new(pts: MediaTime, descriptor: AudioDescriptor, samples: AudioSamples) -> Self {
        let channels = descriptor.channels.max(1) as usize;
        let frames = samples.len() / channels;
        Self {
            pts,
            duration: MediaTime::from_samples(frames as u64, descriptor.sample_rate),
            descriptor,
            samples,
            rate: 1.0,
        }
    }

    /// `frames` sample frames of silence in `f32`.
    pub fn silence(pts: MediaTime, frames: usize, descriptor: AudioDescriptor) -> Self {
        let channels = descriptor.channels.max(1) as usize;
        let descriptor = AudioDescriptor {
            format: SampleFormat::F32,
            ..descriptor
        };
        Self::new(pts, descriptor, AudioSamples::F32(vec![0.0; frames * channels]))
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.descriptor.channels.max(1) as usize
    }

    /// Content time covered by this frame.
    pub fn content_duration(&self) -> MediaTime {
        self.duration.scale(self.rate)
    }

    pub fn end(&self) -> MediaTime {
        self.pts + self.content_duration()
    }
}

impl Weighted for AudioFrame {
    fn cost(&self) -> usize {
        self.frames().max(1)
    }
}

/// Decoded or processed picture.
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub pts: MediaTime,
    pub duration: MediaTime,
    pub descriptor: VideoDescriptor,
    pub data: Arc<[u8]>,
    /// Synthesised for padding or a missing video track.
    pub blank: bool,
}

impl VideoFrame {
    pub fn end(&self) -> MediaTime {
        self.pts + self.duration
    }
}

impl Weighted for VideoFrame {
    fn cost(&self) -> usize {
        1
    }
}

/// Output of a decoding engine.
#[derive(Clone, Debug)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    pub fn pts(&self) -> MediaTime {
        match self {
            Frame::Audio(a) => a.pts,
            Frame::Video(v) => v.pts,
        }
    }

    pub fn end(&self) -> MediaTime {
        match self {
            Frame::Audio(a) => a.end(),
            Frame::Video(v) => v.end(),
        }
    }
}

impl Weighted for Frame {
    fn cost(&self) -> usize {
        match self {
            Frame::Audio(a) => a.cost(),
            Frame::Video(v) => v.cost(),
        }
    }
}

/// Renderer-ready frame tagged with the flush epoch it was produced in.
///
/// Render loops discard anything from an older epoch, which covers frames already
/// popped when a seek flushed the queue.
#[derive(Clone, Debug)]
pub struct Stamped<T> {
    pub epoch: u64,
    pub frame: T,
}

impl<T: Weighted> Weighted for Stamped<T> {
    fn cost(&self) -> usize {
        self.frame.cost()
    }
}
