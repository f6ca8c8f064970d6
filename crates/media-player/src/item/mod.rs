//! Player item: owns the pipeline of one asset and its threads.
//!
//! Threads per item:
//! - one control thread applying seeks, track switches and end-of-playback
//! - one production lane per track kind (see [`crate::pipeline`])
//! - one render loop per track kind, pacing output through the [`Clock`]
//!
//! The public methods are thin: anything that has to stop production goes through
//! the control thread so that lanes are only ever restarted from one place.

mod control;
mod present;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use media_player_types::{PlaybackEndReason, PlaybackState, PlayerStatus, TrackKind};

use self::control::{Command, Control};
use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemTimeSource, TimeSource};
use crate::config::PlayerOptions;
use crate::decoder::{CompositeDecoderFactory, DecoderFactory};
use crate::error::{PlayerError, Result};
use crate::events::{EventBus, PlayerEvent};
use crate::pipeline::Pipeline;
use crate::render::{AudioRenderer, NullAudioRenderer, NullVideoRenderer, VideoRenderer};
use crate::source::{CompositeOpener, SourceOpener};
use crate::time::MediaTime;
use crate::timeline::{Asset, ResolvedSegment, Segment, Timeline};
use crate::track::TrackId;

/// Output epoch per track kind. Frames stamped with an older epoch are stale.
#[derive(Debug, Default)]
pub(crate) struct Epochs {
    audio: AtomicU64,
    video: AtomicU64,
}

impl Epochs {
    fn slot(&self, kind: TrackKind) -> &AtomicU64 {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    pub fn get(&self, kind: TrackKind) -> u64 {
        self.slot(kind).load(Ordering::Acquire)
    }

    pub fn bump(&self, kind: TrackKind) -> u64 {
        self.slot(kind).fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// State shared by the item, its control thread and its render loops.
pub(crate) struct Shared {
    pub pipeline: Arc<Pipeline>,
    pub epochs: Epochs,
    /// Kinds with a production lane, fixed at prepare; the first one leads.
    pub kinds: Vec<TrackKind>,
    /// `f32` volume bits.
    pub volume: AtomicU32,
    pub muted: AtomicBool,
    /// Last underrun count reported by the audio renderer.
    pub underruns: AtomicU64,
    end: Mutex<Option<PlaybackEndReason>>,
    pub cancel: CancelToken,
}

impl Shared {
    fn lock_end(&self) -> MutexGuard<'_, Option<PlaybackEndReason>> {
        self.end.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        *self.lock_end()
    }

    /// Record the terminal reason; `false` if one was already recorded.
    pub fn set_end(&self, reason: PlaybackEndReason) -> bool {
        let mut end = self.lock_end();
        if end.is_some() {
            return false;
        }
        *end = Some(reason);
        true
    }

    pub fn clear_end(&self) {
        *self.lock_end() = None;
    }

    pub fn effective_volume(&self) -> f32 {
        if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            f32::from_bits(self.volume.load(Ordering::Relaxed))
        }
    }

    pub fn lead(&self) -> TrackKind {
        self.kinds.first().copied().unwrap_or(TrackKind::Audio)
    }
}

/// Collaborators and options for [`PlayerItem`]; unset ones get defaults.
pub struct PlayerItemBuilder {
    asset: Asset,
    options: PlayerOptions,
    opener: Option<Arc<dyn SourceOpener>>,
    decoders: Option<Arc<dyn DecoderFactory>>,
    audio: Option<Box<dyn AudioRenderer>>,
    video: Option<Box<dyn VideoRenderer>>,
    time: Option<Arc<dyn TimeSource>>,
}

impl PlayerItemBuilder {
    pub fn options(mut self, options: PlayerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn opener(mut self, opener: Arc<dyn SourceOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn decoders(mut self, decoders: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = Some(decoders);
        self
    }

    pub fn audio_renderer(mut self, renderer: impl AudioRenderer + 'static) -> Self {
        self.audio = Some(Box::new(renderer));
        self
    }

    pub fn video_renderer(mut self, renderer: impl VideoRenderer + 'static) -> Self {
        self.video = Some(Box::new(renderer));
        self
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = Some(time);
        self
    }

    /// Resolve the asset and start buffering. The item starts idle; call
    /// [`PlayerItem::play`] to start the clock.
    ///
    /// The canonical audio format is taken from the audio renderer.
    pub fn prepare(self) -> Result<PlayerItem> {
        let mut options = self.options;
        let audio: Box<dyn AudioRenderer> = self
            .audio
            .unwrap_or_else(|| Box::new(NullAudioRenderer::new(options.processor.audio_format())));
        let video: Box<dyn VideoRenderer> =
            self.video.unwrap_or_else(|| Box::new(NullVideoRenderer));
        let out = audio.output_descriptor();
        options.processor.sample_rate = out.sample_rate;
        options.processor.channels = out.channels;
        options.validate()?;

        let opener = self
            .opener
            .unwrap_or_else(|| Arc::new(CompositeOpener::new()));
        let decoders = self
            .decoders
            .unwrap_or_else(|| Arc::new(CompositeDecoderFactory));
        let time = self.time.unwrap_or_else(|| Arc::new(SystemTimeSource));

        let timeline = Timeline::resolve(&self.asset, opener.as_ref(), &options.demuxer)?;
        tracing::info!(
            segments = timeline.len(),
            duration = %timeline.duration(),
            output = %out,
            "asset prepared"
        );

        let clock = Arc::new(Clock::new(options.clock.clone(), time));
        let events = EventBus::new();
        let pipeline = Arc::new(Pipeline::new(
            self.asset, timeline, options, opener, decoders, clock, events,
        ));
        let mut kinds = pipeline.kinds();
        if kinds.is_empty() {
            // Padding only: still produce silence so the clock has a master.
            kinds.push(TrackKind::Audio);
        }

        let shared = Arc::new(Shared {
            pipeline,
            epochs: Epochs::default(),
            kinds,
            volume: AtomicU32::new(1.0f32.to_bits()),
            muted: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
            end: Mutex::new(None),
            cancel: CancelToken::new(),
        });

        let (tx, rx) = unbounded();
        let mut threads = vec![Control::spawn(shared.clone(), rx)];
        if shared.kinds.contains(&TrackKind::Audio) {
            threads.push(present::spawn_audio(shared.clone(), audio, tx.clone()));
        }
        if shared.kinds.contains(&TrackKind::Video) {
            threads.push(present::spawn_video(shared.clone(), video, tx.clone()));
        }

        Ok(PlayerItem {
            shared,
            commands: tx,
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }
}

/// Completion of an asynchronous seek.
#[derive(Debug)]
pub struct SeekHandle {
    target: MediaTime,
    reply: Receiver<Result<()>>,
}

impl SeekHandle {
    pub fn target(&self) -> MediaTime {
        self.target
    }

    /// Block until production has restarted at the target.
    pub fn wait(self) -> Result<()> {
        self.reply.recv().unwrap_or(Err(PlayerError::Stopped))
    }

    /// Like [`wait`](Self::wait); `None` when the seek is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.reply.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PlayerError::Stopped)),
        }
    }
}

/// One asset being played.
pub struct PlayerItem {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PlayerItem {
    pub fn builder(asset: Asset) -> PlayerItemBuilder {
        PlayerItemBuilder {
            asset,
            options: PlayerOptions::default(),
            opener: None,
            decoders: None,
            audio: None,
            video: None,
            time: None,
        }
    }

    fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }

    fn clock(&self) -> &Clock {
        &self.shared.pipeline.clock
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PlayerError::Stopped);
        }
        Ok(())
    }

    /// Subscribe to notifications published from now on.
    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.pipeline().events.subscribe()
    }

    pub fn duration(&self) -> MediaTime {
        self.pipeline().duration()
    }

    pub fn position(&self) -> MediaTime {
        self.clock().position()
    }

    pub fn state(&self) -> PlaybackState {
        self.clock().state()
    }

    /// Resolved timeline, including segments appended so far.
    pub fn timeline(&self) -> Timeline {
        self.pipeline().timeline()
    }

    pub fn play(&self) -> Result<()> {
        self.ensure_running()?;
        let before = self.clock().state();
        self.clock().play()?;
        if before != PlaybackState::Playing {
            tracing::info!(position = %self.position(), "playing");
            self.publish_state();
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.ensure_running()?;
        if self.clock().state() == PlaybackState::Playing {
            self.clock().pause();
            tracing::info!(position = %self.position(), "paused");
            self.publish_state();
        }
        Ok(())
    }

    fn publish_state(&self) {
        self.pipeline().events.publish(PlayerEvent::StateChanged {
            state: self.clock().state(),
        });
    }

    /// Start a seek to `target`.
    ///
    /// Targets outside `[0, duration]` fail immediately with a clock error; the rest
    /// of the work happens on the control thread and completes through the handle
    /// and a [`PlayerEvent::SeekCompleted`] notification.
    pub fn seek(&self, target: MediaTime) -> Result<SeekHandle> {
        self.ensure_running()?;
        let duration = self.duration();
        if target.is_negative() || target > duration {
            return Err(PlayerError::seek_out_of_range(target, duration));
        }
        let (reply, rx) = bounded(1);
        self.commands
            .send(Command::Seek { target, reply })
            .map_err(|_| PlayerError::Stopped)?;
        Ok(SeekHandle { target, reply: rx })
    }

    /// Change the playback rate. Audio is time-stretched from the next processed
    /// block on; video pacing follows the clock immediately.
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        self.ensure_running()?;
        self.clock().set_rate(rate)?;
        self.pipeline().rate.set(rate);
        tracing::info!(rate, "rate changed");
        Ok(())
    }

    /// Switch the `kind` track of the segment playing now; `None` disables the kind
    /// for that segment.
    ///
    /// Only that kind's production restarts; later segments keep their own selection.
    /// Fails with [`PlayerError::Configuration`] when the item does not play `kind`.
    pub fn select_track(&self, kind: TrackKind, track: Option<TrackId>) -> Result<()> {
        self.ensure_running()?;
        let (reply, rx) = bounded(1);
        self.commands
            .send(Command::SelectTrack { kind, track, reply })
            .map_err(|_| PlayerError::Stopped)?;
        rx.recv().unwrap_or(Err(PlayerError::Stopped))
    }

    /// Resolve `segment` and append it to the end of the timeline.
    ///
    /// Production picks it up if it is still running when it gets there.
    pub fn append_segment(&self, segment: Segment) -> Result<ResolvedSegment> {
        self.ensure_running()?;
        self.pipeline().append(&segment)
    }

    /// Output volume in `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        self.shared.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PlayerStatus {
        let p = self.pipeline();
        let snap = p.clock.snapshot();
        let rate_hz = p.opts.processor.sample_rate.max(1) as u64;
        PlayerStatus {
            state: snap.state,
            position_ms: snap.position.as_millis().max(0) as u64,
            duration_ms: Some(p.duration().as_millis().max(0) as u64),
            rate: snap.rate,
            segment: p.index_at(snap.position).or(p.current_segment()),
            buffered_audio_ms: p.audio_out.occupancy() as u64 * 1000 / rate_hz,
            buffered_video_frames: p.video_out.len() as u64,
            presented_video_frames: snap.presented,
            dropped_video_frames: snap.dropped,
            sync_corrections: snap.corrections,
            decode_errors: p.decode_errors.load(Ordering::Relaxed),
            audio_underruns: self.shared.underruns.load(Ordering::Relaxed),
            video_drift_us: snap.video_drift_us,
            end_reason: self.shared.end_reason(),
        }
    }

    /// Whether playback has ended, by reaching the end, failing or being stopped.
    pub fn is_finished(&self) -> bool {
        self.shared.end_reason().is_some()
    }

    /// Stop every thread of the item. Idempotent; later calls to most methods fail
    /// with [`PlayerError::Stopped`].
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.commands.send(Command::Stop);
        self.shared.cancel.cancel();
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for t in threads {
            if t.join().is_err() {
                tracing::error!("player thread panicked");
            }
        }
        if self.shared.set_end(PlaybackEndReason::Stopped) {
            self.clock().finish(PlaybackEndReason::Stopped);
            let events = &self.pipeline().events;
            events.publish(PlayerEvent::PlaybackEnded {
                reason: PlaybackEndReason::Stopped,
            });
            self.publish_state();
        }
        tracing::info!("player item stopped");
    }
}

impl Drop for PlayerItem {
    fn drop(&mut self) {
        self.stop();
    }
}
