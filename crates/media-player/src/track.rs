//! Tracks and per-segment track selection.

use std::fmt;

use serde::{Deserialize, Serialize};
use symphonia::core::codecs::CodecParameters;

pub use media_player_types::TrackKind;

use crate::error::PlayerError;
use crate::frame::{AudioDescriptor, VideoDescriptor};

/// Stable identifier of an elementary stream within its source.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Format of an elementary stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackDescriptor {
    Audio(AudioDescriptor),
    Video(VideoDescriptor),
}

impl TrackDescriptor {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackDescriptor::Audio(_) => TrackKind::Audio,
            TrackDescriptor::Video(_) => TrackKind::Video,
        }
    }
}

impl fmt::Display for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackDescriptor::Audio(a) => write!(f, "{a}"),
            TrackDescriptor::Video(v) => write!(f, "{v}"),
        }
    }
}

/// Codec identity handed to the decoding engine.
#[derive(Clone, Debug, Serialize)]
pub struct CodecInfo {
    /// Short codec name, e.g. `flac` or `raw_video`.
    pub name: String,
    /// Container-level parameters for symphonia-backed decoders.
    #[serde(skip)]
    pub params: Option<CodecParameters>,
}

impl CodecInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }
}

/// One elementary stream of a source.
#[derive(Clone, Debug, Serialize)]
pub struct Track {
    pub id: TrackId,
    pub codec: CodecInfo,
    pub descriptor: TrackDescriptor,
    pub language: Option<String>,
}

impl Track {
    pub fn kind(&self) -> TrackKind {
        self.descriptor.kind()
    }

    pub fn audio(&self) -> Option<&AudioDescriptor> {
        match &self.descriptor {
            TrackDescriptor::Audio(a) => Some(a),
            TrackDescriptor::Video(_) => None,
        }
    }

    pub fn video(&self) -> Option<&VideoDescriptor> {
        match &self.descriptor {
            TrackDescriptor::Video(v) => Some(v),
            TrackDescriptor::Audio(_) => None,
        }
    }
}

/// Extra audio track summed into the primary by the mixer.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxiliaryTrack {
    pub track: TrackId,
    pub weight: f32,
}

/// Which tracks of a segment's source are active.
///
/// At most one primary audio and one video track; auxiliary audio tracks are mixed
/// underneath the primary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSelection {
    pub audio: Option<TrackId>,
    pub video: Option<TrackId>,
    #[serde(default)]
    pub auxiliary_audio: Vec<AuxiliaryTrack>,
}

impl TrackSelection {
    /// First audio and first video track.
    pub fn default_for(tracks: &[Track]) -> Self {
        Self {
            audio: tracks
                .iter()
                .find(|t| t.kind() == TrackKind::Audio)
                .map(|t| t.id),
            video: tracks
                .iter()
                .find(|t| t.kind() == TrackKind::Video)
                .map(|t| t.id),
            auxiliary_audio: Vec::new(),
        }
    }

    pub fn get(&self, kind: TrackKind) -> Option<TrackId> {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }

    pub fn set(&mut self, kind: TrackKind, track: Option<TrackId>) {
        match kind {
            TrackKind::Audio => self.audio = track,
            TrackKind::Video => self.video = track,
        }
    }

    /// Every track that must be demuxed: primary audio, auxiliaries, then video.
    pub fn demuxed(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self.audio.into_iter().collect();
        for aux in &self.auxiliary_audio {
            if !ids.contains(&aux.track) {
                ids.push(aux.track);
            }
        }
        if let Some(v) = self.video {
            ids.push(v);
        }
        ids
    }

    /// Check every selected id exists in `tracks` with the right kind.
    pub fn validate(&self, tracks: &[Track]) -> Result<(), PlayerError> {
        let check = |id: TrackId, kind: TrackKind| -> Result<(), PlayerError> {
            match tracks.iter().find(|t| t.id == id) {
                Some(t) if t.kind() == kind => Ok(()),
                Some(t) => Err(PlayerError::Configuration(format!(
                    "track {id} is {} but was selected as {kind}",
                    t.kind()
                ))),
                None => Err(PlayerError::Configuration(format!(
                    "track {id} does not exist"
                ))),
            }
        };
        if let Some(a) = self.audio {
            check(a, TrackKind::Audio)?;
        }
        if let Some(v) = self.video {
            check(v, TrackKind::Video)?;
        }
        for aux in &self.auxiliary_audio {
            check(aux.track, TrackKind::Audio)?;
            if !(aux.weight.is_finite() && aux.weight >= 0.0) {
                return Err(PlayerError::Configuration(format!(
                    "auxiliary track {} has invalid weight {}",
                    aux.track, aux.weight
                )));
            }
            if self.audio.is_none() {
                return Err(PlayerError::Configuration(
                    "auxiliary audio requires a primary audio track".into(),
                ));
            }
        }
        Ok(())
    }
}
