//! Compressed audio decoded by Symphonia into interleaved `f32`.

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet as SymphoniaPacket;
use symphonia::core::units::TimeBase;

use super::DecodingEngine;
use crate::error::{PlayerError, Result};
use crate::frame::{AudioDescriptor, AudioFrame, AudioSamples, Frame, Packet, SampleFormat};
use crate::time::MediaTime;
use crate::track::Track;

pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
    time_base: Option<TimeBase>,
}

impl SymphoniaDecoder {
    pub fn new(track: &Track) -> Result<Self> {
        let params = track
            .codec
            .params
            .as_ref()
            .ok_or_else(|| PlayerError::decode(format!("track {} has no codec parameters", track.id)))?;
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .map_err(|e| PlayerError::decode(format!("{}: {e}", track.codec.name)))?;
        Ok(Self {
            decoder,
            time_base: params.time_base,
        })
    }

    fn to_ticks(&self, t: MediaTime) -> u64 {
        let us = t.as_micros().max(0) as u128;
        match self.time_base {
            Some(tb) if tb.numer > 0 => {
                (us * tb.denom as u128 / (tb.numer as u128 * 1_000_000)) as u64
            }
            _ => 0,
        }
    }
}

impl DecodingEngine for SymphoniaDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>> {
        let sp = SymphoniaPacket::new_from_slice(
            packet.track.0,
            self.to_ticks(packet.pts),
            self.to_ticks(packet.duration),
            &packet.data,
        );
        let decoded = match self.decoder.decode(&sp) {
            Ok(d) => d,
            Err(SymphoniaError::ResetRequired) => {
                self.decoder.reset();
                return Err(PlayerError::decode("decoder reset required"));
            }
            Err(e) => return Err(PlayerError::decode(e.to_string())),
        };
        if decoded.frames() == 0 {
            return Ok(Vec::new());
        }
        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let descriptor = AudioDescriptor::new(spec.rate, spec.channels.count() as u16, SampleFormat::F32);
        Ok(vec![Frame::Audio(AudioFrame::new(
            packet.pts,
            descriptor,
            AudioSamples::F32(sample_buf.samples().to_vec()),
        ))])
    }

    fn reset(&mut self) {
        self.decoder.reset();
    }
}
