//! Synthetic `synth://` sources.
//!
//! Tone audio and flat test-pattern video generated on the fly, with knobs for
//! B-frame style reordering, corrupt payloads and demux failures. Used by the
//! integration tests and the CLI dry runs.
//!
//! Query keys (all optional):
//! - `duration=<secs>` (default 10)
//! - `audio=<rate>x<channels>` or `audio=0` (default `48000x2`)
//! - `freq=<hz>`, `amp=<0..1>`, `format=f32|s16`
//! - `aux=1` adds a second audio track at 1.5× the frequency
//! - `video=<w>x<h>@<fps>` or `video=0` (default `16x8@25`)
//! - `reorder=1` emits video in I-P-B-B decode order
//! - `fail_at=<secs>` fails with a demux error once packets reach that time
//! - `corrupt_every=<n>`, `corrupt_kind=audio|video` truncates every n-th packet
//! - `open_error=1` fails on open

use super::{Demuxable, SourceOpener};
use crate::config::DemuxerOptions;
use crate::error::{PlayerError, Result};
use crate::frame::{AudioDescriptor, Packet, PixelFormat, SampleFormat, VideoDescriptor};
use crate::time::MediaTime;
use crate::track::{CodecInfo, Track, TrackDescriptor, TrackId, TrackKind};

pub(crate) const SCHEME: &str = "synth://";

pub const AUDIO_TRACK: TrackId = TrackId(1);
pub const VIDEO_TRACK: TrackId = TrackId(2);
pub const AUX_TRACK: TrackId = TrackId(3);

/// Sample frames per audio packet.
const AUDIO_BLOCK: u64 = 1024;
/// Video frames per group of pictures.
const GOP: u64 = 12;
/// Decode order within each group of four when reordering.
const REORDER: [u64; 4] = [0, 3, 1, 2];

/// Parsed `synth://` query.
#[derive(Clone, Debug, PartialEq)]
pub struct SynthParams {
    pub duration: MediaTime,
    pub audio: Option<(u32, u16)>,
    pub freq: f64,
    pub amplitude: f32,
    pub sample_format: SampleFormat,
    pub aux: bool,
    pub video: Option<(u32, u32, f64)>,
    pub reorder: bool,
    pub fail_at: Option<MediaTime>,
    pub corrupt_every: Option<u64>,
    pub corrupt_kind: Option<TrackKind>,
    pub open_error: bool,
}

impl Default for SynthParams {
    fn default() -> Self {
        Self {
            duration: MediaTime::from_secs(10),
            audio: Some((48_000, 2)),
            freq: 440.0,
            amplitude: 0.5,
            sample_format: SampleFormat::F32,
            aux: false,
            video: Some((16, 8, 25.0)),
            reorder: false,
            fail_at: None,
            corrupt_every: None,
            corrupt_kind: None,
            open_error: false,
        }
    }
}

impl SynthParams {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| PlayerError::Configuration(format!("not a synthetic url: {url}")))?;
        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");
        let mut p = SynthParams::default();
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let bad = || PlayerError::Configuration(format!("{url}: bad value for {key}: {value:?}"));
            match key {
                "duration" => p.duration = MediaTime::from_secs_f64(parse_num(value).ok_or_else(bad)?),
                "audio" if value == "0" => p.audio = None,
                "audio" => {
                    let (rate, ch) = value.split_once('x').ok_or_else(bad)?;
                    p.audio = Some((
                        rate.parse().map_err(|_| bad())?,
                        ch.parse().map_err(|_| bad())?,
                    ));
                }
                "freq" => p.freq = parse_num(value).ok_or_else(bad)?,
                "amp" => p.amplitude = parse_num(value).ok_or_else(bad)? as f32,
                "format" => {
                    p.sample_format = match value {
                        "f32" => SampleFormat::F32,
                        "s16" => SampleFormat::I16,
                        _ => return Err(bad()),
                    }
                }
                "aux" => p.aux = value == "1",
                "video" if value == "0" => p.video = None,
                "video" => {
                    let (dims, fps) = value.split_once('@').ok_or_else(bad)?;
                    let (w, h) = dims.split_once('x').ok_or_else(bad)?;
                    p.video = Some((
                        w.parse().map_err(|_| bad())?,
                        h.parse().map_err(|_| bad())?,
                        parse_num(fps).ok_or_else(bad)?,
                    ));
                }
                "reorder" => p.reorder = value == "1",
                "fail_at" => {
                    p.fail_at = Some(MediaTime::from_secs_f64(parse_num(value).ok_or_else(bad)?))
                }
                "corrupt_every" => {
                    p.corrupt_every = Some(value.parse().map_err(|_| bad())?).filter(|n| *n > 0)
                }
                "corrupt_kind" => {
                    p.corrupt_kind = match value {
                        "audio" => Some(TrackKind::Audio),
                        "video" => Some(TrackKind::Video),
                        _ => return Err(bad()),
                    }
                }
                "open_error" => p.open_error = value == "1",
                _ => tracing::debug!(url, key, "ignoring unknown synthetic parameter"),
            }
        }
        if p.duration <= MediaTime::ZERO {
            return Err(PlayerError::Configuration(format!("{url}: duration must be positive")));
        }
        if matches!(p.audio, Some((0, _)) | Some((_, 0))) {
            return Err(PlayerError::Configuration(format!("{url}: empty audio format")));
        }
        if let Some((w, h, fps)) = p.video {
            if w == 0 || h == 0 || !(fps.is_finite() && fps > 0.0) {
                return Err(PlayerError::Configuration(format!("{url}: empty video format")));
            }
        }
        Ok(p)
    }
}

fn parse_num(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Opens `synth://` URLs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticOpener;

impl SourceOpener for SyntheticOpener {
    fn open(&self, url: &str, _opts: &DemuxerOptions) -> Result<Box<dyn Demuxable>> {
        let params = SynthParams::parse(url)?;
        if params.open_error {
            return Err(PlayerError::io(format!("{url}: connection refused")));
        }
        Ok(Box::new(SyntheticSource::new(params)))
    }
}

struct SyntheticSource {
    params: SynthParams,
    tracks: Vec<Track>,
    audio_blocks: u64,
    video_frames: u64,
    next_block: u64,
    /// Aux packet for the current block still owed.
    aux_pending: bool,
    next_video: u64,
    emitted: u64,
    failed: bool,
}

impl SyntheticSource {
    fn new(params: SynthParams) -> Self {
        let mut tracks = Vec::new();
        let mut audio_blocks = 0;
        if let Some((rate, channels)) = params.audio {
            let codec = match params.sample_format {
                SampleFormat::I16 => "pcm_s16le",
                _ => "pcm_f32le",
            };
            let descriptor = AudioDescriptor::new(rate, channels, params.sample_format);
            tracks.push(Track {
                id: AUDIO_TRACK,
                codec: CodecInfo::named(codec),
                descriptor: TrackDescriptor::Audio(descriptor),
                language: Some("und".into()),
            });
            if params.aux {
                tracks.push(Track {
                    id: AUX_TRACK,
                    codec: CodecInfo::named(codec),
                    descriptor: TrackDescriptor::Audio(descriptor),
                    language: Some("und".into()),
                });
            }
            let total = params.duration.to_samples(rate).max(0) as u64;
            audio_blocks = total.div_ceil(AUDIO_BLOCK);
        }
        let mut video_frames = 0;
        if let Some((w, h, fps)) = params.video {
            let mut descriptor = VideoDescriptor::new(w, h, PixelFormat::Yuv420p);
            descriptor.frame_rate = Some(fps);
            tracks.push(Track {
                id: VIDEO_TRACK,
                codec: CodecInfo::named("raw_video"),
                descriptor: TrackDescriptor::Video(descriptor),
                language: None,
            });
            video_frames = (params.duration.as_secs_f64() * fps).ceil() as u64;
        }
        Self {
            params,
            tracks,
            audio_blocks,
            video_frames,
            next_block: 0,
            aux_pending: false,
            next_video: 0,
            emitted: 0,
            failed: false,
        }
    }

    fn block_time(&self, block: u64) -> MediaTime {
        let rate = self.params.audio.map(|(r, _)| r).unwrap_or(1);
        MediaTime::from_samples(block * AUDIO_BLOCK, rate)
    }

    fn frame_time(&self, index: u64) -> MediaTime {
        let fps = self.params.video.map(|(_, _, f)| f).unwrap_or(1.0);
        MediaTime::from_secs_f64(index as f64 / fps)
    }

    /// Presentation index of the frame at decode position `pos`.
    fn presentation_index(&self, pos: u64) -> u64 {
        if !self.params.reorder {
            return pos;
        }
        let group = pos / 4;
        if group * 4 + 4 > self.video_frames {
            return pos;
        }
        group * 4 + REORDER[(pos % 4) as usize]
    }

    fn audio_packet(&self, track: TrackId, block: u64) -> Packet {
        let (rate, channels) = self.params.audio.unwrap_or((48_000, 2));
        let total = self.params.duration.to_samples(rate).max(0) as u64;
        let first = block * AUDIO_BLOCK;
        let frames = AUDIO_BLOCK.min(total.saturating_sub(first));
        let freq = if track == AUX_TRACK {
            self.params.freq * 1.5
        } else {
            self.params.freq
        };
        let amp = self.params.amplitude;
        let step = std::f64::consts::TAU * freq / rate as f64;

        let mut data = Vec::with_capacity(
            frames as usize * channels as usize * self.params.sample_format.bytes_per_sample(),
        );
        for n in first..first + frames {
            let v = amp * (step * n as f64).sin() as f32;
            for _ in 0..channels {
                match self.params.sample_format {
                    SampleFormat::I16 => {
                        data.extend_from_slice(&((v * 32_767.0) as i16).to_le_bytes())
                    }
                    _ => data.extend_from_slice(&v.to_le_bytes()),
                }
            }
        }
        let pts = self.block_time(block);
        Packet {
            track,
            dts: pts,
            pts,
            duration: MediaTime::from_samples(frames, rate),
            keyframe: true,
            data,
        }
    }

    fn video_packet(&self, pos: u64) -> Packet {
        let (w, h, _) = self.params.video.unwrap_or((16, 8, 25.0));
        let index = self.presentation_index(pos);
        let luma = 16 + (index * 7 % 220) as u8;
        let luma_len = (w * h) as usize;
        let size = PixelFormat::Yuv420p.frame_size(w, h);
        let mut data = vec![128u8; size];
        data[..luma_len].fill(luma);
        Packet {
            track: VIDEO_TRACK,
            dts: self.frame_time(pos),
            pts: self.frame_time(index),
            duration: self.frame_time(index + 1) - self.frame_time(index),
            keyframe: index % GOP == 0,
            data,
        }
    }

    fn next_packet(&mut self) -> Option<Packet> {
        if self.aux_pending {
            self.aux_pending = false;
            return Some(self.audio_packet(AUX_TRACK, self.next_block - 1));
        }
        let audio_at = (self.next_block < self.audio_blocks).then(|| self.block_time(self.next_block));
        let video_at = (self.next_video < self.video_frames).then(|| self.frame_time(self.next_video));
        match (audio_at, video_at) {
            (Some(a), v) if v.is_none_or(|v| a <= v) => {
                let packet = self.audio_packet(AUDIO_TRACK, self.next_block);
                self.next_block += 1;
                self.aux_pending = self.params.aux;
                Some(packet)
            }
            (_, Some(_)) => {
                let packet = self.video_packet(self.next_video);
                self.next_video += 1;
                Some(packet)
            }
            _ => None,
        }
    }

    fn maybe_corrupt(&mut self, mut packet: Packet) -> Packet {
        let Some(every) = self.params.corrupt_every else {
            return packet;
        };
        let kind = if packet.track == VIDEO_TRACK {
            TrackKind::Video
        } else {
            TrackKind::Audio
        };
        if self.params.corrupt_kind.is_some_and(|k| k != kind) {
            return packet;
        }
        self.emitted += 1;
        if self.emitted % every == 0 {
            packet.data.truncate(3);
        }
        packet
    }
}

impl Demuxable for SyntheticSource {
    fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    fn duration(&self) -> Option<MediaTime> {
        Some(self.params.duration)
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.failed {
            return Err(PlayerError::demux("source already failed"));
        }
        let Some(packet) = self.next_packet() else {
            return Ok(None);
        };
        if let Some(at) = self.params.fail_at {
            if packet.dts >= at {
                self.failed = true;
                return Err(PlayerError::demux(format!("malformed container data at {at}")));
            }
        }
        Ok(Some(self.maybe_corrupt(packet)))
    }

    fn seek(&mut self, to: MediaTime) -> Result<MediaTime> {
        let to = to.max(MediaTime::ZERO).min(self.params.duration);
        let mut reached = to;
        if let Some((rate, _)) = self.params.audio {
            let block = (to.to_samples(rate).max(0) as u64 / AUDIO_BLOCK).min(self.audio_blocks);
            self.next_block = block;
            reached = reached.min(self.block_time(block));
        }
        if let Some((_, _, fps)) = self.params.video {
            let frame = (to.as_secs_f64() * fps).floor() as u64;
            let key = (frame / GOP * GOP).min(self.video_frames);
            self.next_video = key;
            reached = reached.min(self.frame_time(key));
        }
        self.aux_pending = false;
        self.failed = false;
        Ok(reached)
    }
}
