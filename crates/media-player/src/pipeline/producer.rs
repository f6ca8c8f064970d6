//! Production lane: one thread walking the timeline for one track kind.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use media_player_types::{PlaybackEndReason, TrackKind};

use super::{Pipeline, SegmentOutcome};
use crate::cancel::CancelToken;
use crate::events::PlayerEvent;
use crate::time::MediaTime;
use crate::timeline::ResolvedSegment;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LaneEnd {
    /// Ran out of segments; the output queue is closed.
    Finished(PlaybackEndReason),
    Cancelled,
}

/// Handle to a running lane.
pub(crate) struct Producer {
    kind: TrackKind,
    cancel: CancelToken,
    handle: Option<JoinHandle<LaneEnd>>,
}

impl Producer {
    /// Start producing `kind` from asset time `from`, stamping output with `epoch`.
    ///
    /// The leading lane also announces segment transitions.
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        kind: TrackKind,
        from: MediaTime,
        epoch: u64,
        lead: bool,
        parent: &CancelToken,
    ) -> Self {
        let cancel = parent.child();
        let token = cancel.clone();
        let handle = thread::spawn(move || run(&pipeline, kind, from, epoch, lead, &token));
        Self {
            kind,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Cancel and wait for the lane to wind down.
    pub fn stop(mut self) -> LaneEnd {
        self.cancel.cancel();
        self.join()
    }

    fn join(&mut self) -> LaneEnd {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(end)) => end,
            Some(Err(_)) => {
                tracing::error!(kind = %self.kind, "producer thread panicked");
                LaneEnd::Finished(PlaybackEndReason::Error)
            }
            None => LaneEnd::Cancelled,
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.cancel.cancel();
            self.join();
        }
    }
}

fn run(
    p: &Pipeline,
    kind: TrackKind,
    from: MediaTime,
    epoch: u64,
    lead: bool,
    cancel: &CancelToken,
) -> LaneEnd {
    let mut index = p.index_at(from);
    let mut from = from;
    let mut prev: Option<ResolvedSegment> = None;
    let mut failed = false;
    tracing::debug!(%kind, from = %from, epoch, "producer started");

    while let Some(seg) = index.and_then(|i| p.segment(i)) {
        if cancel.is_cancelled() {
            return LaneEnd::Cancelled;
        }
        if lead {
            p.segment.store(seg.index, Ordering::Relaxed);
            announce(p, kind, prev.as_ref(), &seg);
        }
        tracing::info!(segment = seg.index, %kind, start = %seg.start, from = %from, "segment started");
        match p.run_segment(kind, &seg, from, epoch, cancel) {
            SegmentOutcome::Completed => failed = false,
            SegmentOutcome::Failed(e) => {
                failed = true;
                if p.segment(seg.index + 1).is_some() {
                    tracing::warn!(segment = seg.index, %kind, "segment failed, advancing: {e:#}");
                    p.report(&e, seg.index);
                } else {
                    tracing::error!(segment = seg.index, %kind, "last segment failed: {e:#}");
                }
            }
            SegmentOutcome::Cancelled => return LaneEnd::Cancelled,
        }
        from = seg.end();
        index = Some(seg.index + 1);
        prev = Some(seg);
    }

    if cancel.is_cancelled() {
        return LaneEnd::Cancelled;
    }
    let reason = if failed {
        PlaybackEndReason::Error
    } else {
        PlaybackEndReason::Eof
    };
    tracing::info!(%kind, ?reason, "producer finished");
    p.finish_lane(kind, reason);
    LaneEnd::Finished(reason)
}

/// Hold the notifications for moving from `prev` into `seg` until playback
/// reaches `seg.start`.
///
/// Nothing is announced for the first segment of a run.
fn announce(p: &Pipeline, kind: TrackKind, prev: Option<&ResolvedSegment>, seg: &ResolvedSegment) {
    let Some(prev) = prev else {
        return;
    };
    let at = seg.start;
    p.hold_boundary(
        kind,
        at,
        PlayerEvent::SegmentAdvanced {
            at,
            segment: seg.index,
        },
    );

    let tracks = |s: &ResolvedSegment| {
        let sel = s.selection();
        (s.url().map(str::to_owned), sel.audio, sel.video)
    };
    let (url, audio, video) = tracks(seg);
    if tracks(prev) != (url.clone(), audio, video) {
        p.hold_boundary(
            kind,
            at,
            PlayerEvent::TrackChanged {
                at,
                segment: seg.index,
                url,
                audio,
                video,
            },
        );
    }

    let formats = |s: &ResolvedSegment| {
        (
            s.selected(TrackKind::Audio).and_then(|t| t.audio().copied()),
            s.selected(TrackKind::Video).and_then(|t| t.video().copied()),
        )
    };
    let (audio, video) = formats(seg);
    if formats(prev) != (audio, video) {
        p.hold_boundary(
            kind,
            at,
            PlayerEvent::FormatChanged {
                at,
                segment: seg.index,
                audio,
                video,
            },
        );
    }
}
