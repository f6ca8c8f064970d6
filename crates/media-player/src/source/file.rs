//! Local file sources opened and demuxed with Symphonia.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use super::{Demuxable, SourceOpener};
use crate::config::DemuxerOptions;
use crate::error::{PlayerError, Result};
use crate::frame::{AudioDescriptor, Packet, SampleFormat};
use crate::time::MediaTime;
use crate::track::{CodecInfo, Track, TrackDescriptor, TrackId};

/// Smallest read-ahead buffer symphonia accepts.
const MIN_READ_BUFFER: usize = 64 * 1024;

/// Opens local files (plain paths or `file://` URLs).
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaOpener;

impl SourceOpener for SymphoniaOpener {
    fn open(&self, url: &str, opts: &DemuxerOptions) -> Result<Box<dyn Demuxable>> {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        let file = File::open(path).map_err(|e| PlayerError::io(format!("open {path:?}: {e}")))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let buffer_len = opts
            .read_hint_bytes
            .map(|n| (n as usize).max(MIN_READ_BUFFER).next_power_of_two())
            .unwrap_or(MIN_READ_BUFFER);
        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions { buffer_len });

        let detected = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| map_error(e, path))?;

        SymphoniaSource::new(detected.format).map(|s| Box::new(s) as Box<dyn Demuxable>)
    }
}

struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    tracks: Vec<Track>,
    time_bases: HashMap<u32, TimeBase>,
    duration: Option<MediaTime>,
}

impl SymphoniaSource {
    fn new(format: Box<dyn FormatReader>) -> Result<Self> {
        let mut tracks = Vec::new();
        let mut time_bases = HashMap::new();
        let mut duration: Option<MediaTime> = None;

        for t in format.tracks() {
            let params = &t.codec_params;
            if params.codec == CODEC_TYPE_NULL {
                continue;
            }
            let (Some(rate), Some(channels)) = (params.sample_rate, params.channels) else {
                continue;
            };
            let tb = params.time_base.unwrap_or_else(|| TimeBase::new(1, rate));
            time_bases.insert(t.id, tb);
            if let Some(d) = duration_from_codec_params(params, tb) {
                duration = Some(duration.map_or(d, |cur| cur.max(d)));
            }
            tracks.push(Track {
                id: TrackId(t.id),
                codec: CodecInfo {
                    name: codec_name_from_params(params).unwrap_or("unknown").to_string(),
                    params: Some(params.clone()),
                },
                // Decoders hand out interleaved f32 regardless of the stored depth.
                descriptor: TrackDescriptor::Audio(AudioDescriptor::new(
                    rate,
                    channels.count() as u16,
                    SampleFormat::F32,
                )),
                language: t.language.clone(),
            });
        }

        if tracks.is_empty() {
            return Err(PlayerError::demux("no decodable audio track"));
        }
        Ok(Self {
            format,
            tracks,
            time_bases,
            duration,
        })
    }

    fn to_media_time(&self, track: u32, ts: u64) -> MediaTime {
        match self.time_bases.get(&track) {
            Some(tb) => MediaTime::from_ticks(ts, tb.numer, tb.denom),
            None => MediaTime::ZERO,
        }
    }
}

impl Demuxable for SymphoniaSource {
    fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    fn duration(&self) -> Option<MediaTime> {
        self.duration
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::IoError(e)) => {
                    return Err(PlayerError::io(format!("read packet: {e}")));
                }
                Err(e) => return Err(PlayerError::demux(format!("read packet: {e}"))),
            };
            let track = packet.track_id();
            if !self.time_bases.contains_key(&track) {
                continue;
            }
            let pts = self.to_media_time(track, packet.ts());
            return Ok(Some(Packet {
                track: TrackId(track),
                dts: pts,
                pts,
                duration: self.to_media_time(track, packet.dur()),
                keyframe: true,
                data: packet.buf().to_vec(),
            }));
        }
    }

    fn seek(&mut self, to: MediaTime) -> Result<MediaTime> {
        let us = to.as_micros().max(0) as u64;
        let time = Time::new(us / 1_000_000, (us % 1_000_000) as f64 / 1_000_000.0);
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: None,
                },
            )
            .map_err(|e| PlayerError::demux(format!("seek to {to}: {e}")))?;
        Ok(self.to_media_time(seeked.track_id, seeked.actual_ts))
    }
}

fn map_error(e: SymphoniaError, path: &Path) -> PlayerError {
    match e {
        SymphoniaError::IoError(io) => PlayerError::io(format!("open {path:?}: {io}")),
        other => PlayerError::demux(format!("open {path:?}: {other}")),
    }
}

/// Best-effort duration from codec metadata.
fn duration_from_codec_params(params: &CodecParameters, tb: TimeBase) -> Option<MediaTime> {
    let frames = params.n_frames?;
    if tb.denom == 0 {
        return None;
    }
    Some(MediaTime::from_ticks(frames, tb.numer, tb.denom))
}

/// Short codec label for track listings.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "flac",
        CODEC_TYPE_MP3 => "mp3",
        CODEC_TYPE_AAC => "aac",
        CODEC_TYPE_ALAC => "alac",
        CODEC_TYPE_VORBIS => "vorbis",
        CODEC_TYPE_OPUS => "opus",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "pcm_s16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "pcm_s24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "pcm_s32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "pcm_f32",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    #[test]
    fn duration_from_codec_params_uses_time_base() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        let d = duration_from_codec_params(&params, TimeBase::new(1, 48_000)).unwrap();
        assert_eq!(d, MediaTime::from_secs(2));
    }

    #[test]
    fn duration_from_codec_params_needs_frame_count() {
        let params = CodecParameters::new();
        assert!(duration_from_codec_params(&params, TimeBase::new(1, 44_100)).is_none());
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("flac"));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_name_from_params(&params), Some("pcm_s16"));
        assert!(codec_name_from_params(&CodecParameters::new()).is_none());
    }
}
