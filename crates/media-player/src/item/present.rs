//! Render loops: hand processed frames to the renderers, paced by the clock.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use media_player_types::{BufferingState, PlaybackState, TrackKind};

use super::Shared;
use super::control::Command;
use crate::cancel::CANCEL_POLL;
use crate::clock::VideoDecision;
use crate::events::PlayerEvent;
use crate::frame::{Stamped, VideoFrame};
use crate::queue::Popped;
use crate::render::{AudioRenderer, VideoRenderer};

/// Audio kept queued in the renderer ahead of playback.
const AUDIO_LEAD: Duration = Duration::from_millis(200);

/// Buffering transition worth announcing, if any.
///
/// `Normal` is only announced when recovering from `Empty` or `Low`, so a queue
/// hovering around its high watermark does not flap between `Normal` and `Full`.
pub(crate) fn buffering_transition(
    last: BufferingState,
    now: BufferingState,
) -> Option<BufferingState> {
    match (last, now) {
        (a, b) if a == b => None,
        (BufferingState::Full | BufferingState::Normal, BufferingState::Normal) => None,
        (_, b) => Some(b),
    }
}

struct BufferingWatch {
    kind: TrackKind,
    last: BufferingState,
}

impl BufferingWatch {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            last: BufferingState::Empty,
        }
    }

    fn observe(&mut self, shared: &Shared, level: BufferingState) {
        if let Some(state) = buffering_transition(self.last, level) {
            self.last = state;
            tracing::debug!(kind = %self.kind, ?state, "buffering changed");
            shared.pipeline.events.publish(PlayerEvent::BufferingChanged {
                track: self.kind,
                state,
            });
        }
    }
}

/// Park while the clock is not running. Returns `false` once the item is cancelled.
fn wait_for_playback(shared: &Shared) -> bool {
    let clock = &shared.pipeline.clock;
    if !clock.wait_until_playing(&shared.cancel) {
        if shared.cancel.is_cancelled() {
            return false;
        }
        // Ended or failed; a seek may bring it back.
        thread::sleep(CANCEL_POLL);
    }
    true
}

pub(crate) fn spawn_audio(
    shared: Arc<Shared>,
    renderer: Box<dyn AudioRenderer>,
    control: Sender<Command>,
) -> JoinHandle<()> {
    thread::spawn(move || audio_loop(&shared, renderer, &control))
}

fn audio_loop(shared: &Shared, mut renderer: Box<dyn AudioRenderer>, control: &Sender<Command>) {
    let p = &shared.pipeline;
    let mut epoch = shared.epochs.get(TrackKind::Audio);
    let mut reported: Option<u64> = None;
    let mut cursor: Option<Instant> = None;
    let mut paused = false;
    let mut volume = 1.0f32;
    let mut buffering = BufferingWatch::new(TrackKind::Audio);

    while !shared.cancel.is_cancelled() {
        let current = shared.epochs.get(TrackKind::Audio);
        if current != epoch {
            renderer.flush();
            cursor = None;
            epoch = current;
        }
        let v = shared.effective_volume();
        if v != volume {
            renderer.set_volume(v);
            volume = v;
        }
        let playing = p.clock.state() == PlaybackState::Playing;
        if playing == paused {
            renderer.set_paused(!playing);
            paused = !playing;
            // Queued audio is held while paused.
            cursor = None;
        }
        if !playing {
            if !wait_for_playback(shared) {
                break;
            }
            continue;
        }

        p.release_boundaries(p.clock.position());
        let popped = p.audio_out.pop_timeout(CANCEL_POLL, &shared.cancel);
        buffering.observe(shared, p.audio_out.level());
        let Stamped { epoch: stamp, frame } = match popped {
            Popped::Item(item) => item,
            Popped::TimedOut => continue,
            Popped::Cancelled => break,
            Popped::Closed => {
                if reported != Some(epoch) {
                    // Let queued audio play out before calling it a day.
                    if let Some(end) = cursor {
                        if !p.clock.wait_until(end, &shared.cancel) {
                            continue;
                        }
                    }
                    reported = Some(epoch);
                    let _ = control.send(Command::Drained {
                        kind: TrackKind::Audio,
                        epoch,
                    });
                }
                thread::sleep(CANCEL_POLL);
                continue;
            }
        };
        if stamp != epoch {
            continue;
        }

        let now = p.clock.now();
        let when = cursor.map_or(now, |c| c.max(now));
        let at = match renderer.present(&frame, when) {
            Ok(at) => at,
            Err(e) => {
                tracing::error!("audio renderer error: {e:#}");
                let _ = control.send(Command::Fatal(e));
                break;
            }
        };
        p.clock.audio_presented(frame.pts, at, frame.rate);
        shared.underruns.store(renderer.underruns(), Ordering::Relaxed);
        let end = at + frame.duration.to_duration();
        cursor = Some(end);
        p.clock.wait_until(end.checked_sub(AUDIO_LEAD).unwrap_or(end), &shared.cancel);
    }
    renderer.set_paused(true);
    renderer.flush();
}

pub(crate) fn spawn_video(
    shared: Arc<Shared>,
    renderer: Box<dyn VideoRenderer>,
    control: Sender<Command>,
) -> JoinHandle<()> {
    thread::spawn(move || video_loop(&shared, renderer, &control))
}

fn video_loop(shared: &Shared, mut renderer: Box<dyn VideoRenderer>, control: &Sender<Command>) {
    let p = &shared.pipeline;
    let mut epoch = shared.epochs.get(TrackKind::Video);
    let mut reported: Option<u64> = None;
    let mut pending: Option<VideoFrame> = None;
    let mut buffering = BufferingWatch::new(TrackKind::Video);

    while !shared.cancel.is_cancelled() {
        let current = shared.epochs.get(TrackKind::Video);
        if current != epoch {
            renderer.flush();
            pending = None;
            epoch = current;
        }
        if p.clock.state() != PlaybackState::Playing {
            if !wait_for_playback(shared) {
                break;
            }
            continue;
        }

        p.release_boundaries(p.clock.position());
        let frame = match pending.take() {
            Some(frame) => frame,
            None => {
                let popped = p.video_out.pop_timeout(CANCEL_POLL, &shared.cancel);
                buffering.observe(shared, p.video_out.level());
                match popped {
                    Popped::Item(Stamped { epoch: stamp, frame }) if stamp == epoch => frame,
                    Popped::Item(_) | Popped::TimedOut => continue,
                    Popped::Cancelled => break,
                    Popped::Closed => {
                        if reported != Some(epoch) {
                            reported = Some(epoch);
                            let _ = control.send(Command::Drained {
                                kind: TrackKind::Video,
                                epoch,
                            });
                        }
                        thread::sleep(CANCEL_POLL);
                        continue;
                    }
                }
            }
        };

        let expected = match p.clock.schedule_video(frame.pts) {
            VideoDecision::Drop { late } => {
                tracing::debug!(pts = %frame.pts, late = %late, "video frame dropped");
                continue;
            }
            VideoDecision::ForceSync { at } => at,
            VideoDecision::Present { at } => {
                if !p.clock.wait_until(at, &shared.cancel) {
                    // Paused, seeking or stopping; reconsider the frame afterwards.
                    pending = Some(frame);
                    continue;
                }
                at
            }
        };
        match renderer.present(&frame, expected) {
            Ok(actual) => p.clock.report_delivery(TrackKind::Video, expected, actual),
            Err(e) => {
                tracing::error!("video renderer error: {e:#}");
                let _ = control.send(Command::Fatal(e));
                break;
            }
        }
    }
    renderer.flush();
}
