//! Decoding engine collaborators.
//!
//! An engine is created per track and segment; it is stateful across packets
//! (reference frames, codec delay) and is reset on seek.

mod audio_codec;
mod raw;

pub use audio_codec::SymphoniaDecoder;
pub use raw::{RawAudioDecoder, RawVideoDecoder};

use crate::config::DecoderOptions;
use crate::error::{PlayerError, Result};
use crate::frame::{Frame, Packet};
use crate::track::{Track, TrackDescriptor};

/// Turns packets of one track into zero or more decoded frames.
pub trait DecodingEngine: Send {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>>;

    /// Emit anything held back at end of stream.
    fn flush(&mut self) -> Result<Vec<Frame>> {
        Ok(Vec::new())
    }

    /// Forget inter-packet state; the next packet should be a keyframe.
    fn reset(&mut self);
}

/// Creates an engine for a track.
pub trait DecoderFactory: Send + Sync {
    fn make(&self, track: &Track, opts: &DecoderOptions) -> Result<Box<dyn DecodingEngine>>;
}

/// Routes by codec: tracks from containers go to symphonia, raw payloads to the raw decoders.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompositeDecoderFactory;

impl DecoderFactory for CompositeDecoderFactory {
    fn make(&self, track: &Track, opts: &DecoderOptions) -> Result<Box<dyn DecodingEngine>> {
        if opts.prefer_hardware {
            tracing::debug!(track = %track.id, codec = %track.codec.name, "no hardware decoder available; using software");
        }
        match (&track.descriptor, track.codec.name.as_str()) {
            (TrackDescriptor::Audio(desc), "pcm_f32le" | "pcm_s16le") => {
                Ok(Box::new(RawAudioDecoder::new(*desc)))
            }
            (TrackDescriptor::Video(desc), "raw_video") => Ok(Box::new(RawVideoDecoder::new(*desc))),
            (TrackDescriptor::Audio(_), _) if track.codec.params.is_some() => {
                Ok(Box::new(SymphoniaDecoder::new(track)?))
            }
            (_, name) => Err(PlayerError::decode(format!(
                "no decoder for codec {name} on {} track {}",
                track.kind(),
                track.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AudioDescriptor, PixelFormat, SampleFormat, VideoDescriptor};
    use crate::track::{CodecInfo, TrackId};

    fn track(name: &str, descriptor: TrackDescriptor) -> Track {
        Track {
            id: TrackId(1),
            codec: CodecInfo::named(name),
            descriptor,
            language: None,
        }
    }

    #[test]
    fn factory_routes_raw_codecs() {
        let f = CompositeDecoderFactory;
        let opts = DecoderOptions::default();
        let audio = TrackDescriptor::Audio(AudioDescriptor::new(48_000, 2, SampleFormat::F32));
        let video = TrackDescriptor::Video(VideoDescriptor::new(4, 4, PixelFormat::Yuv420p));
        assert!(f.make(&track("pcm_f32le", audio.clone()), &opts).is_ok());
        assert!(f.make(&track("raw_video", video), &opts).is_ok());
        let err = f.make(&track("h264", audio), &opts).err().unwrap();
        assert!(matches!(err, PlayerError::Decode { .. }));
    }
}
