//! Control thread: the single place where production lanes are started and stopped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use media_player_types::{PlaybackEndReason, PlaybackState, TrackKind};

use super::Shared;
use crate::cancel::CANCEL_POLL;
use crate::error::{PlayerError, Result};
use crate::events::PlayerEvent;
use crate::pipeline::producer::Producer;
use crate::time::MediaTime;
use crate::track::TrackId;

pub(crate) enum Command {
    Seek {
        target: MediaTime,
        reply: Sender<Result<()>>,
    },
    SelectTrack {
        kind: TrackKind,
        track: Option<TrackId>,
        reply: Sender<Result<()>>,
    },
    /// A render loop consumed everything `epoch` of `kind` produced.
    Drained { kind: TrackKind, epoch: u64 },
    /// A render loop hit an error the item cannot recover from.
    Fatal(PlayerError),
    Stop,
}

pub(crate) struct Control {
    shared: Arc<Shared>,
    lanes: HashMap<TrackKind, Producer>,
    drained: HashSet<TrackKind>,
    ended: bool,
}

impl Control {
    pub fn spawn(shared: Arc<Shared>, commands: Receiver<Command>) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut control = Control {
                shared,
                lanes: HashMap::new(),
                drained: HashSet::new(),
                ended: false,
            };
            control.run(&commands);
            control.stop_lanes();
        })
    }

    fn run(&mut self, commands: &Receiver<Command>) {
        let kinds = self.shared.kinds.clone();
        for kind in kinds {
            self.start_lane(kind, MediaTime::ZERO);
        }
        loop {
            let cmd = match commands.recv_timeout(CANCEL_POLL) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.cancel.is_cancelled() {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };
            match cmd {
                Command::Seek { target, reply } => {
                    let result = self.seek(target);
                    if let Err(e) = &result {
                        tracing::error!(target = %target, "seek failed: {e:#}");
                        if matches!(e, PlayerError::Inconsistent(_)) {
                            self.fail(e);
                        }
                    }
                    self.shared.pipeline.events.publish(PlayerEvent::SeekCompleted {
                        target,
                        result: result.as_ref().map(|_| ()).map_err(ToString::to_string),
                    });
                    let _ = reply.send(result);
                }
                Command::SelectTrack { kind, track, reply } => {
                    let result = self.select_track(kind, track);
                    if let Err(e @ PlayerError::Inconsistent(_)) = &result {
                        self.fail(e);
                    }
                    let _ = reply.send(result);
                }
                Command::Drained { kind, epoch } => self.drained(kind, epoch),
                Command::Fatal(e) => self.fail(&e),
                Command::Stop => return,
            }
        }
    }

    fn start_lane(&mut self, kind: TrackKind, from: MediaTime) {
        let s = &self.shared;
        let lane = Producer::spawn(
            s.pipeline.clone(),
            kind,
            from,
            s.epochs.get(kind),
            kind == s.lead(),
            &s.cancel,
        );
        self.lanes.insert(lane.kind(), lane);
    }

    fn stop_lanes(&mut self) {
        for (_, lane) in self.lanes.drain() {
            lane.stop();
        }
    }

    /// Discard everything buffered for `kind` and accept output again.
    ///
    /// The lane of `kind` must be stopped.
    fn flush_output(&self, kind: TrackKind) -> Result<()> {
        let p = &self.shared.pipeline;
        let dropped = match kind {
            TrackKind::Audio => {
                let n = p.audio_out.flush()?;
                p.audio_out.reopen();
                n
            }
            TrackKind::Video => {
                let n = p.video_out.flush()?;
                p.video_out.reopen();
                n
            }
        };
        tracing::debug!(%kind, dropped, "output flushed");
        Ok(())
    }

    fn seek(&mut self, target: MediaTime) -> Result<()> {
        let p = self.shared.pipeline.clone();
        let before = p.clock.state();
        if before == PlaybackState::Failed {
            return Err(PlayerError::Clock {
                message: "cannot seek a failed item".into(),
            });
        }
        self.stop_lanes();
        let kinds = self.shared.kinds.clone();
        for &kind in &kinds {
            self.flush_output(kind)?;
        }
        // Bumped after the reopen so no render loop sees a closed queue under the
        // new epoch.
        for &kind in &kinds {
            self.shared.epochs.bump(kind);
        }
        p.reset_run(&kinds);
        p.clock.seek(target);
        self.drained.clear();
        self.ended = false;
        self.shared.clear_end();
        for &kind in &kinds {
            self.start_lane(kind, target);
        }
        tracing::info!(target = %target, "seek completed");
        let after = p.clock.state();
        if after != before {
            p.events.publish(PlayerEvent::StateChanged { state: after });
        }
        Ok(())
    }

    fn select_track(&mut self, kind: TrackKind, track: Option<TrackId>) -> Result<()> {
        if !self.shared.kinds.contains(&kind) {
            return Err(PlayerError::Configuration(format!(
                "item has no {kind} output to switch"
            )));
        }
        let p = self.shared.pipeline.clone();
        let from = p.clock.position();
        let index = p
            .index_at(from)
            .or_else(|| p.current_segment())
            .ok_or_else(|| PlayerError::Configuration("no segment is playing".into()))?;
        p.set_selection(index, kind, track)?;
        tracing::info!(segment = index, %kind, track = ?track, "track selected");
        if self.ended {
            return Ok(());
        }

        if let Some(lane) = self.lanes.remove(&kind) {
            lane.stop();
        }
        self.flush_output(kind)?;
        self.shared.epochs.bump(kind);
        p.reset_run(&[kind]);
        self.drained.remove(&kind);
        if kind == TrackKind::Audio {
            p.clock.release_audio();
        }
        self.start_lane(kind, from);

        if let Some(seg) = p.segment(index) {
            let sel = seg.selection();
            p.events.publish(PlayerEvent::TrackChanged {
                at: from,
                segment: index,
                url: seg.url().map(str::to_owned),
                audio: sel.audio,
                video: sel.video,
            });
        }
        Ok(())
    }

    fn drained(&mut self, kind: TrackKind, epoch: u64) {
        if self.ended || epoch != self.shared.epochs.get(kind) {
            return;
        }
        self.drained.insert(kind);
        let kinds = &self.shared.kinds;
        if !kinds.iter().all(|k| self.drained.contains(k)) {
            return;
        }
        if let Some(reason) = self.shared.pipeline.end_reason(kinds) {
            self.finish(reason);
        }
    }

    fn finish(&mut self, reason: PlaybackEndReason) {
        self.ended = true;
        if !self.shared.set_end(reason) {
            return;
        }
        let p = &self.shared.pipeline;
        p.clock.finish(reason);
        p.release_boundaries(p.clock.position());
        tracing::info!(?reason, position = %p.clock.position(), "playback ended");
        p.events.publish(PlayerEvent::PlaybackEnded { reason });
        p.events.publish(PlayerEvent::StateChanged {
            state: p.clock.state(),
        });
    }

    /// Terminate the item after an unrecoverable error.
    fn fail(&mut self, err: &PlayerError) {
        if self.ended {
            return;
        }
        tracing::error!("player item failed: {err:#}");
        self.stop_lanes();
        let p = &self.shared.pipeline;
        p.audio_out.close();
        p.video_out.close();
        p.events.publish(PlayerEvent::fatal(err));
        self.finish(PlaybackEndReason::Error);
    }
}
