//! Decoders for uncompressed payloads.

use std::sync::Arc;

use super::DecodingEngine;
use crate::error::{PlayerError, Result};
use crate::frame::{AudioDescriptor, AudioFrame, AudioSamples, Frame, Packet, SampleFormat, VideoDescriptor, VideoFrame};

/// Little-endian interleaved PCM.
pub struct RawAudioDecoder {
    descriptor: AudioDescriptor,
}

impl RawAudioDecoder {
    pub fn new(descriptor: AudioDescriptor) -> Self {
        Self { descriptor }
    }
}

impl DecodingEngine for RawAudioDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>> {
        let bps = self.descriptor.format.bytes_per_sample();
        let frame_bytes = bps * self.descriptor.channels.max(1) as usize;
        if packet.data.is_empty() || packet.data.len() % frame_bytes != 0 {
            return Err(PlayerError::decode(format!(
                "pcm payload of {} bytes is not a whole number of {frame_bytes}-byte frames",
                packet.data.len()
            )));
        }
        let samples = match self.descriptor.format {
            SampleFormat::F32 => AudioSamples::F32(
                packet
                    .data
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            SampleFormat::I16 => AudioSamples::I16(
                packet
                    .data
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            ),
            SampleFormat::I32 => AudioSamples::I32(
                packet
                    .data
                    .chunks_exact(4)
                    .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            SampleFormat::U8 => AudioSamples::U8(packet.data.clone()),
        };
        Ok(vec![Frame::Audio(AudioFrame::new(
            packet.pts,
            self.descriptor,
            samples,
        ))])
    }

    fn reset(&mut self) {}
}

/// Uncompressed pictures whose packets still carry keyframe dependencies.
///
/// Non-key pictures are refused until a keyframe has been seen since the last reset.
pub struct RawVideoDecoder {
    descriptor: VideoDescriptor,
    has_reference: bool,
}

impl RawVideoDecoder {
    pub fn new(descriptor: VideoDescriptor) -> Self {
        Self {
            descriptor,
            has_reference: false,
        }
    }
}

impl DecodingEngine for RawVideoDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>> {
        let expected = self.descriptor.frame_size();
        if packet.data.len() != expected {
            self.has_reference = false;
            return Err(PlayerError::decode(format!(
                "picture payload is {} bytes, expected {expected}",
                packet.data.len()
            )));
        }
        if packet.keyframe {
            self.has_reference = true;
        } else if !self.has_reference {
            return Err(PlayerError::decode("picture references a missing keyframe"));
        }
        Ok(vec![Frame::Video(VideoFrame {
            pts: packet.pts,
            duration: packet.duration,
            descriptor: self.descriptor,
            data: Arc::from(packet.data.as_slice()),
            blank: false,
        })])
    }

    fn reset(&mut self) {
        self.has_reference = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::time::MediaTime;
    use crate::track::TrackId;

    fn packet(data: Vec<u8>, keyframe: bool) -> Packet {
        Packet {
            track: TrackId(1),
            dts: MediaTime::ZERO,
            pts: MediaTime::from_millis(40),
            duration: MediaTime::from_millis(40),
            keyframe,
            data,
        }
    }

    #[test]
    fn pcm_s16_keeps_native_format() {
        let mut dec = RawAudioDecoder::new(AudioDescriptor::new(8_000, 1, SampleFormat::I16));
        let mut data = Vec::new();
        data.extend_from_slice(&1000i16.to_le_bytes());
        data.extend_from_slice(&(-1000i16).to_le_bytes());
        let frames = dec.decode(&packet(data, true)).unwrap();
        let Frame::Audio(a) = &frames[0] else {
            panic!("expected audio");
        };
        assert_eq!(a.samples, AudioSamples::I16(vec![1000, -1000]));
        assert_eq!(a.frames(), 2);
        assert_eq!(a.pts, MediaTime::from_millis(40));
    }

    #[test]
    fn truncated_pcm_is_a_decode_error() {
        let mut dec = RawAudioDecoder::new(AudioDescriptor::new(48_000, 2, SampleFormat::F32));
        assert!(matches!(
            dec.decode(&packet(vec![0; 3], true)),
            Err(PlayerError::Decode { .. })
        ));
    }

    #[test]
    fn video_needs_keyframe_after_reset() {
        let desc = VideoDescriptor::new(4, 2, PixelFormat::Yuv420p);
        let mut dec = RawVideoDecoder::new(desc);
        let size = desc.frame_size();
        assert!(dec.decode(&packet(vec![0; size], false)).is_err());
        assert_eq!(dec.decode(&packet(vec![0; size], true)).unwrap().len(), 1);
        assert_eq!(dec.decode(&packet(vec![0; size], false)).unwrap().len(), 1);
        dec.reset();
        assert!(dec.decode(&packet(vec![0; size], false)).is_err());
    }
}
