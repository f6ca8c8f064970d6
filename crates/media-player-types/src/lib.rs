use serde::{Deserialize, Serialize};

/// Reason why playback of an asset ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of the last segment.
    Eof,
    /// A segment failed and no further segment was available, or the item failed.
    Error,
    /// Playback was explicitly stopped by a command.
    Stopped,
}

/// Elementary stream kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Fill level of a stage queue, as reported by its capacity gate.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BufferingState {
    /// Nothing buffered.
    #[default]
    Empty,
    /// Below the low watermark; upstream should produce more.
    Low,
    /// Between the watermarks.
    Normal,
    /// At or above the high watermark; upstream is suspended.
    Full,
}

/// Lifecycle state of a player item.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Ended,
    Failed,
}

/// Point-in-time playback status of one player item.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayerStatus {
    /// Current lifecycle state.
    pub state: PlaybackState,
    /// Master clock position in milliseconds.
    pub position_ms: u64,
    /// Total asset duration in milliseconds, once prepared.
    pub duration_ms: Option<u64>,
    /// Requested playback rate.
    pub rate: f64,
    /// Index of the segment currently being produced.
    pub segment: Option<usize>,
    /// Buffered renderer-ready audio in milliseconds.
    pub buffered_audio_ms: u64,
    /// Buffered renderer-ready video frames.
    pub buffered_video_frames: u64,
    /// Video frames presented to the renderer.
    pub presented_video_frames: u64,
    /// Video frames dropped for lateness.
    pub dropped_video_frames: u64,
    /// Forced catch-up corrections performed by the clock.
    pub sync_corrections: u64,
    /// Packets skipped because they failed to decode.
    pub decode_errors: u64,
    /// Times the audio output ran dry.
    pub audio_underruns: u64,
    /// Smoothed video delivery drift in microseconds (expected - actual).
    pub video_drift_us: i64,
    /// Terminal reason once playback ended.
    pub end_reason: Option<PlaybackEndReason>,
}
