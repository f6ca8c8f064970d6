//! Conversion of decoded audio to the renderer's canonical format.
//!
//! Sample format, channel layout and rate are converted in that order. Output
//! timestamps are derived from the running output sample count so that resampled
//! frames stay sample-accurate.

use super::resample::StreamResampler;
use crate::error::{PlayerError, Result};
use crate::frame::{AudioDescriptor, AudioFrame, AudioSamples, SampleFormat};
use crate::time::MediaTime;

/// Remap interleaved `f32` between channel counts.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - same count: pass-through
/// - other layouts: best-effort "clamp to available channels"
pub fn map_channels(src: &[f32], src_channels: usize, dst_channels: usize) -> Vec<f32> {
    if src_channels == dst_channels || src_channels == 0 || dst_channels == 0 {
        return src.to_vec();
    }
    let frames = src.len() / src_channels;
    let mut out = Vec::with_capacity(frames * dst_channels);
    for frame in src.chunks_exact(src_channels) {
        for dst_ch in 0..dst_channels {
            let v = match (src_channels, dst_channels) {
                (2, 1) => 0.5 * (frame[0] + frame[1]),
                (1, _) => frame[0],
                _ => frame[dst_ch.min(src_channels - 1)],
            };
            out.push(v);
        }
    }
    out
}

/// Converts one track's decoded frames to the canonical descriptor.
pub struct AudioFormatter {
    src: AudioDescriptor,
    dst: AudioDescriptor,
    resampler: Option<StreamResampler>,
    /// Content time of the next output sample.
    next_pts: Option<MediaTime>,
    frames_out: u64,
}

impl AudioFormatter {
    pub fn new(src: AudioDescriptor, dst: AudioDescriptor, chunk_frames: usize) -> Result<Self> {
        if dst.format != SampleFormat::F32 {
            return Err(PlayerError::process(format!(
                "canonical audio must be f32, got {:?}",
                dst.format
            )));
        }
        let resampler = if src.sample_rate == dst.sample_rate {
            tracing::debug!(rate_hz = dst.sample_rate, "resample skipped");
            None
        } else {
            tracing::debug!(
                from_hz = src.sample_rate,
                rate_hz = dst.sample_rate,
                "resampling"
            );
            Some(StreamResampler::new(
                src.sample_rate,
                dst.sample_rate,
                dst.channels as usize,
                chunk_frames,
            )?)
        };
        Ok(Self {
            src,
            dst,
            resampler,
            next_pts: None,
            frames_out: 0,
        })
    }

    pub fn source(&self) -> AudioDescriptor {
        self.src
    }

    /// Convert one decoded frame. Returns `None` while the resampler is still filling.
    pub fn push(&mut self, frame: &AudioFrame) -> Result<Option<AudioFrame>> {
        let samples = self.remap(&frame.samples);
        match &mut self.resampler {
            Some(rs) => {
                let anchor = *self.next_pts.get_or_insert(frame.pts);
                let out = rs.process(&samples)?;
                Ok(self.emit(anchor, out))
            }
            // Pass-through keeps the decoder's own timestamps.
            None => Ok(self.emit(frame.pts, samples)),
        }
    }

    /// Flush the resampler tail at end of stream.
    pub fn finish(&mut self) -> Result<Option<AudioFrame>> {
        let Some(anchor) = self.next_pts else {
            return Ok(None);
        };
        let out = match &mut self.resampler {
            Some(rs) => rs.finish()?,
            None => Vec::new(),
        };
        Ok(self.emit(anchor, out))
    }

    fn remap(&self, samples: &AudioSamples) -> Vec<f32> {
        let f = samples.to_f32();
        map_channels(&f, self.src.channels as usize, self.dst.channels as usize)
    }

    fn emit(&mut self, anchor: MediaTime, samples: Vec<f32>) -> Option<AudioFrame> {
        let frames = samples.len() / self.dst.channels.max(1) as usize;
        if frames == 0 {
            return None;
        }
        let pts = anchor + MediaTime::from_samples(self.frames_out, self.dst.sample_rate);
        if self.resampler.is_some() {
            self.frames_out += frames as u64;
        }
        Some(AudioFrame::new(pts, self.dst, AudioSamples::F32(samples)))
    }
}
