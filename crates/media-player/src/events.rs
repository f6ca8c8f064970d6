//! Notifications surfaced to the outside of a player item.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};
use media_player_types::{BufferingState, PlaybackEndReason, PlaybackState, TrackKind};
use serde::Serialize;

use crate::error::PlayerError;
use crate::frame::{AudioDescriptor, VideoDescriptor};
use crate::time::MediaTime;
use crate::track::TrackId;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlayerEvent {
    StateChanged {
        state: PlaybackState,
    },
    /// The tracks being played changed at asset time `at`.
    TrackChanged {
        at: MediaTime,
        segment: usize,
        url: Option<String>,
        audio: Option<TrackId>,
        video: Option<TrackId>,
    },
    /// Source formats changed at asset time `at`.
    FormatChanged {
        at: MediaTime,
        segment: usize,
        audio: Option<AudioDescriptor>,
        video: Option<VideoDescriptor>,
    },
    SegmentAdvanced {
        at: MediaTime,
        segment: usize,
    },
    BufferingChanged {
        track: TrackKind,
        state: BufferingState,
    },
    SeekCompleted {
        target: MediaTime,
        result: Result<(), String>,
    },
    RecoverableError {
        message: String,
        segment: Option<usize>,
        track: Option<TrackId>,
    },
    FatalError {
        message: String,
    },
    PlaybackEnded {
        reason: PlaybackEndReason,
    },
}

impl PlayerEvent {
    pub fn recoverable(err: &PlayerError) -> Self {
        let ctx = err.context();
        Self::RecoverableError {
            message: err.to_string(),
            segment: ctx.segment,
            track: ctx.track,
        }
    }

    pub fn fatal(err: &PlayerError) -> Self {
        Self::FatalError {
            message: err.to_string(),
        }
    }
}

/// Fan-out of [`PlayerEvent`]s to any number of subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next publish.
#[derive(Clone, Debug, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<PlayerEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn publish(&self, event: PlayerEvent) {
        tracing::debug!(?event, "event");
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
