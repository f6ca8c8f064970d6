//! Error taxonomy for the playback pipeline.
//!
//! Packet-level decode failures are recovered inside the decode stage; segment-level
//! source/demux failures are recovered by the orchestrator advancing the timeline.
//! `Configuration` and `Clock` errors surface synchronously to the caller, and
//! `Inconsistent` always terminates the player item.

use std::fmt;

use crate::time::MediaTime;
use crate::track::TrackId;

/// Where in the asset an error happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub segment: Option<usize>,
    pub track: Option<TrackId>,
}

impl ErrorContext {
    pub fn segment(index: usize) -> Self {
        Self {
            segment: Some(index),
            track: None,
        }
    }

    pub fn with_track(mut self, track: TrackId) -> Self {
        self.track = Some(track);
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.segment, self.track) {
            (Some(s), Some(t)) => write!(f, " (segment {s}, track {t})"),
            (Some(s), None) => write!(f, " (segment {s})"),
            (None, Some(t)) => write!(f, " (track {t})"),
            (None, None) => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PlayerError {
    /// I/O or network failure while reading a source.
    #[error("source error: {message}{context}")]
    Source {
        message: String,
        context: ErrorContext,
    },

    /// Malformed or unsupported container.
    #[error("demux error: {message}{context}")]
    Demux {
        message: String,
        context: ErrorContext,
    },

    /// Malformed elementary stream payload.
    #[error("decode error: {message}{context}")]
    Decode {
        message: String,
        context: ErrorContext,
    },

    /// Unsupported format conversion.
    #[error("process error: {message}{context}")]
    Process {
        message: String,
        context: ErrorContext,
    },

    /// Invalid clock operation, e.g. a seek outside the asset.
    #[error("clock error: {message}")]
    Clock { message: String },

    /// Invalid option or asset combination.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Renderer collaborator failed.
    #[error("render error: {0}")]
    Render(String),

    /// Pipeline bookkeeping diverged from reality; the item cannot continue.
    #[error("pipeline inconsistent: {0}")]
    Inconsistent(String),

    #[error("player item is not prepared")]
    NotPrepared,

    #[error("player item is stopped")]
    Stopped,
}

impl PlayerError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn demux(message: impl Into<String>) -> Self {
        Self::Demux {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn seek_out_of_range(target: MediaTime, duration: MediaTime) -> Self {
        Self::Clock {
            message: format!("seek target {target} outside asset [0, {duration}]"),
        }
    }

    /// Attach segment/track context to stage errors; other variants pass through.
    pub fn in_context(self, ctx: ErrorContext) -> Self {
        match self {
            Self::Source { message, .. } => Self::Source {
                message,
                context: ctx,
            },
            Self::Demux { message, .. } => Self::Demux {
                message,
                context: ctx,
            },
            Self::Decode { message, .. } => Self::Decode {
                message,
                context: ctx,
            },
            Self::Process { message, .. } => Self::Process {
                message,
                context: ctx,
            },
            other => other,
        }
    }

    pub fn context(&self) -> ErrorContext {
        match self {
            Self::Source { context, .. }
            | Self::Demux { context, .. }
            | Self::Decode { context, .. }
            | Self::Process { context, .. } => *context,
            _ => ErrorContext::default(),
        }
    }

    /// Whether the pipeline can continue past this error by skipping a packet or segment.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Source { .. } | Self::Demux { .. } | Self::Decode { .. } | Self::Process { .. }
        )
    }
}

pub type Result<T, E = PlayerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_rendered_in_message() {
        let err = PlayerError::demux("bad box")
            .in_context(ErrorContext::segment(2).with_track(TrackId(1)));
        assert_eq!(err.to_string(), "demux error: bad box (segment 2, track 1)");
        assert_eq!(err.context().segment, Some(2));
    }

    #[test]
    fn recoverability_follows_taxonomy() {
        assert!(PlayerError::decode("x").is_recoverable());
        assert!(PlayerError::io("x").is_recoverable());
        assert!(!PlayerError::Configuration("x".into()).is_recoverable());
        assert!(!PlayerError::Inconsistent("x".into()).is_recoverable());
        let clock = PlayerError::seek_out_of_range(MediaTime::from_secs(20), MediaTime::from_secs(12));
        assert!(!clock.is_recoverable());
    }

    #[test]
    fn in_context_leaves_lifecycle_errors_alone() {
        let err = PlayerError::NotPrepared.in_context(ErrorContext::segment(0));
        assert!(matches!(err, PlayerError::NotPrepared));
    }
}
