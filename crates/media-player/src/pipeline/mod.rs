//! Stage graph of one asset.
//!
//! Production is split into one lane per track kind. A lane walks the timeline
//! segment by segment; for each segment it stands up demux and decode threads for
//! the tracks of its kind, runs the process stage itself, and tears everything
//! down before moving on. Keeping the kinds apart lets a track switch restart one
//! kind without disturbing the other.
//!
//! Stage threads follow one pattern: run, log and record a failure, close the
//! queue they feed. A decode or process failure cancels the segment; a demux
//! failure only closes the packet queues, so what was already demuxed still plays.

pub(crate) mod producer;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use media_player_types::{PlaybackEndReason, TrackKind};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::config::PlayerOptions;
use crate::decode::{self, DecodeJob};
use crate::decoder::DecoderFactory;
use crate::demux::{self, DemuxJob};
use crate::error::{PlayerError, Result};
use crate::events::{EventBus, PlayerEvent};
use crate::frame::{AudioFrame, Frame, Packet, Stamped, VideoDescriptor, VideoFrame};
use crate::process::{self, AudioJob, SharedRate, VideoConverter, VideoJob};
use crate::queue::{StageQueue, calc_max_buffered_frames};
use crate::source::SourceOpener;
use crate::time::MediaTime;
use crate::timeline::{Asset, ResolvedKind, ResolvedSegment, Segment, Timeline};
use crate::track::{Track, TrackId};

/// First failure of a segment.
#[derive(Clone)]
pub(crate) struct SegmentFault {
    first: Arc<Mutex<Option<PlayerError>>>,
    cancel: CancelToken,
}

impl SegmentFault {
    fn new(cancel: CancelToken) -> Self {
        Self {
            first: Arc::new(Mutex::new(None)),
            cancel,
        }
    }

    /// Record `err` and cancel the segment's stages.
    fn record(&self, err: PlayerError) {
        self.note(err);
        self.cancel.cancel();
    }

    /// Record `err`, leaving the stages to drain what they already hold.
    fn note(&self, err: PlayerError) {
        let mut g = self.first.lock().unwrap_or_else(|e| e.into_inner());
        if g.is_none() {
            *g = Some(err);
        }
    }

    fn take(&self) -> Option<PlayerError> {
        self.first.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Boundary notification held until playback reaches `at`.
struct PendingBoundary {
    kind: TrackKind,
    at: MediaTime,
    event: PlayerEvent,
}

#[derive(Debug)]
pub(crate) enum SegmentOutcome {
    Completed,
    Failed(PlayerError),
    Cancelled,
}

/// Collaborators and shared state every lane of an item works with.
pub(crate) struct Pipeline {
    pub opener: Arc<dyn SourceOpener>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub opts: PlayerOptions,
    pub events: EventBus,
    pub clock: Arc<Clock>,
    pub rate: SharedRate,
    pub decode_errors: Arc<AtomicU64>,
    pub audio_out: Arc<StageQueue<Stamped<AudioFrame>>>,
    pub video_out: Arc<StageQueue<Stamped<VideoFrame>>>,
    /// Format of synthesised pictures.
    pub blank: VideoDescriptor,
    asset: Asset,
    timeline: RwLock<Timeline>,
    /// Asset segments already folded into the timeline.
    asset_known: AtomicUsize,
    segment: AtomicUsize,
    reported: Mutex<HashSet<usize>>,
    boundaries: Mutex<Vec<PendingBoundary>>,
    ends: Mutex<HashMap<TrackKind, PlaybackEndReason>>,
}

impl Pipeline {
    pub fn new(
        asset: Asset,
        timeline: Timeline,
        opts: PlayerOptions,
        opener: Arc<dyn SourceOpener>,
        decoders: Arc<dyn DecoderFactory>,
        clock: Arc<Clock>,
        events: EventBus,
    ) -> Self {
        let canon = opts.processor.audio_format();
        let b = &opts.buffering;
        let audio_high = calc_max_buffered_frames(canon.sample_rate, b.output_audio_seconds);
        let video_high = b.output_video_frames;
        let blank = timeline
            .segments()
            .iter()
            .find_map(|s| s.selected(TrackKind::Video).and_then(Track::video).copied())
            .map(|src| VideoConverter::new(&opts.processor).target(&src))
            .unwrap_or_else(|| {
                VideoDescriptor::new(
                    opts.processor.width.unwrap_or(16),
                    opts.processor.height.unwrap_or(16),
                    opts.processor.pixel_format,
                )
            });
        clock.set_limit(timeline.duration());
        Self {
            opener,
            decoders,
            events,
            clock,
            rate: SharedRate::default(),
            decode_errors: Arc::new(AtomicU64::new(0)),
            audio_out: Arc::new(StageQueue::new("audio output", audio_high / 4, audio_high)),
            video_out: Arc::new(StageQueue::new("video output", video_high / 4, video_high)),
            blank,
            asset_known: AtomicUsize::new(asset.segments().len()),
            asset,
            timeline: RwLock::new(timeline),
            segment: AtomicUsize::new(usize::MAX),
            reported: Mutex::new(HashSet::new()),
            boundaries: Mutex::new(Vec::new()),
            ends: Mutex::new(HashMap::new()),
            opts,
        }
    }

    fn read_timeline(&self) -> std::sync::RwLockReadGuard<'_, Timeline> {
        self.timeline.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_timeline(&self) -> std::sync::RwLockWriteGuard<'_, Timeline> {
        self.timeline.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn duration(&self) -> MediaTime {
        self.read_timeline().duration()
    }

    pub fn timeline(&self) -> Timeline {
        self.read_timeline().clone()
    }

    /// Track kinds played anywhere on the timeline.
    pub fn kinds(&self) -> Vec<TrackKind> {
        let t = self.read_timeline();
        [TrackKind::Audio, TrackKind::Video]
            .into_iter()
            .filter(|k| t.has_kind(*k))
            .collect()
    }

    /// Index of the segment active at `t`.
    pub fn index_at(&self, t: MediaTime) -> Option<usize> {
        self.read_timeline().resolve_time(t).map(|s| s.index)
    }

    /// Segment `index`, folding in segments appended to the asset when needed.
    pub fn segment(&self, index: usize) -> Option<ResolvedSegment> {
        if let Some(s) = self.read_timeline().get(index) {
            return Some(s.clone());
        }
        self.extend();
        self.read_timeline().get(index).cloned()
    }

    /// Segment currently being produced by the leading lane.
    pub fn current_segment(&self) -> Option<usize> {
        match self.segment.load(Ordering::Relaxed) {
            usize::MAX => None,
            i => Some(i),
        }
    }

    fn extend(&self) {
        let known = self.asset_known.load(Ordering::Acquire);
        let added = self.asset.appended_after(known);
        if added.is_empty() {
            return;
        }
        let mut timeline = self.write_timeline();
        // Another lane may have folded them in meanwhile.
        if self.asset_known.load(Ordering::Acquire) != known {
            return;
        }
        for segment in &added {
            if let Err(e) = timeline.append(segment, self.opener.as_ref(), &self.opts.demuxer) {
                tracing::warn!("appended segment rejected: {e:#}");
                self.events.publish(PlayerEvent::recoverable(&e));
            }
        }
        self.asset_known.store(known + added.len(), Ordering::Release);
        self.clock.set_limit(timeline.duration());
    }

    /// Resolve `segment` and append it at the end of the timeline.
    pub fn append(&self, segment: &Segment) -> Result<ResolvedSegment> {
        let mut timeline = self.write_timeline();
        let resolved = timeline
            .append(segment, self.opener.as_ref(), &self.opts.demuxer)?
            .clone();
        self.clock.set_limit(timeline.duration());
        tracing::info!(segment = resolved.index, start = %resolved.start, "segment appended");
        Ok(resolved)
    }

    pub fn set_selection(&self, index: usize, kind: TrackKind, track: Option<TrackId>) -> Result<()> {
        self.write_timeline().set_selection(index, kind, track)
    }

    /// Forget per-run bookkeeping before lanes are (re)started.
    pub fn reset_run(&self, kinds: &[TrackKind]) {
        self.lock_reported().clear();
        self.lock_boundaries().retain(|b| !kinds.contains(&b.kind));
        let mut ends = self.lock_ends();
        for k in kinds {
            ends.remove(k);
        }
    }

    fn lock_reported(&self) -> MutexGuard<'_, HashSet<usize>> {
        self.reported.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_boundaries(&self) -> MutexGuard<'_, Vec<PendingBoundary>> {
        self.boundaries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `event` for publication once playback reaches `at`. Held events of
    /// `kind` are dropped when its lane restarts.
    pub(crate) fn hold_boundary(&self, kind: TrackKind, at: MediaTime, event: PlayerEvent) {
        self.lock_boundaries().push(PendingBoundary { kind, at, event });
    }

    /// Publish, in production order, every held notification due at or before `reached`.
    pub(crate) fn release_boundaries(&self, reached: MediaTime) {
        let mut due = Vec::new();
        self.lock_boundaries().retain(|b| {
            if b.at <= reached {
                due.push(b.event.clone());
                false
            } else {
                true
            }
        });
        for event in due {
            self.events.publish(event);
        }
    }

    fn lock_ends(&self) -> MutexGuard<'_, HashMap<TrackKind, PlaybackEndReason>> {
        self.ends.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a segment failure once, however many lanes hit it.
    fn report(&self, err: &PlayerError, segment: usize) {
        if self.lock_reported().insert(segment) {
            self.events.publish(PlayerEvent::recoverable(err));
        }
    }

    /// Record why `kind` stopped producing and close its output.
    fn finish_lane(&self, kind: TrackKind, reason: PlaybackEndReason) {
        self.lock_ends().insert(kind, reason);
        match kind {
            TrackKind::Audio => self.audio_out.close(),
            TrackKind::Video => self.video_out.close(),
        }
    }

    /// How playback ends once every lane in `kinds` has finished; `None` while any
    /// is still producing.
    pub fn end_reason(&self, kinds: &[TrackKind]) -> Option<PlaybackEndReason> {
        let ends = self.lock_ends();
        let mut reason = PlaybackEndReason::Eof;
        for k in kinds {
            if *ends.get(k)? == PlaybackEndReason::Error {
                reason = PlaybackEndReason::Error;
            }
        }
        Some(reason)
    }

    /// Produce `[from, seg.end())` of `seg` for `kind`.
    pub(crate) fn run_segment(
        &self,
        kind: TrackKind,
        seg: &ResolvedSegment,
        from: MediaTime,
        epoch: u64,
        cancel: &CancelToken,
    ) -> SegmentOutcome {
        let seg_cancel = cancel.child();
        let fault = SegmentFault::new(seg_cancel.clone());
        let truncated = Arc::new(AtomicBool::new(false));
        let tracks = lane_tracks(seg, kind);
        let b = &self.opts.buffering;
        let (frame_low, frame_high) = match kind {
            TrackKind::Audio => (b.frame_low * 1024, b.frame_high * 1024),
            TrackKind::Video => (b.frame_low, b.frame_high),
        };

        let mut threads: Vec<JoinHandle<()>> = Vec::new();
        let mut frame_queues: Vec<(Arc<StageQueue<Frame>>, f32)> = Vec::new();
        let mut routes = Vec::new();
        for (track, weight) in &tracks {
            let packets: Arc<StageQueue<Packet>> =
                Arc::new(StageQueue::new("packets", b.packet_low_bytes, b.packet_high_bytes));
            let frames: Arc<StageQueue<Frame>> =
                Arc::new(StageQueue::new("frames", frame_low, frame_high));
            routes.push((track.id, packets.clone()));
            frame_queues.push((frames.clone(), *weight));

            let job = DecodeJob {
                segment: seg.index,
                track: track.clone(),
                input: packets,
                output: frames.clone(),
                factory: self.decoders.clone(),
                opts: self.opts.decoder.clone(),
                errors: self.decode_errors.clone(),
                cancel: seg_cancel.clone(),
            };
            let fault = fault.clone();
            let segment = seg.index;
            threads.push(thread::spawn(move || {
                let track = job.track.id;
                if let Err(e) = decode::run(job) {
                    tracing::error!(segment, %track, "decoder thread error: {e:#}");
                    fault.record(e);
                }
                frames.close();
            }));
        }

        if !routes.is_empty() {
            let packet_queues: Vec<_> = routes.iter().map(|(_, q)| q.clone()).collect();
            let job = DemuxJob {
                segment: seg.clone(),
                from,
                routes,
                opener: self.opener.clone(),
                opts: self.opts.demuxer.clone(),
                cancel: seg_cancel.clone(),
            };
            let fault = fault.clone();
            let truncated = truncated.clone();
            let segment = seg.index;
            threads.push(thread::spawn(move || {
                // Decode and process drain what was demuxed before the failure.
                if let Err(e) = demux::run(job) {
                    tracing::error!(segment, "demux thread error: {e:#}");
                    fault.note(e);
                    truncated.store(true, Ordering::Release);
                }
                for q in &packet_queues {
                    q.close();
                }
            }));
        }

        let window = (from, seg.end());
        let result = match kind {
            TrackKind::Audio => process::run_audio(AudioJob {
                segment: seg.index,
                window,
                inputs: frame_queues,
                output: self.audio_out.clone(),
                epoch,
                opts: self.opts.processor.clone(),
                rate: self.rate.clone(),
                truncated: truncated.clone(),
                cancel: seg_cancel.clone(),
            }),
            TrackKind::Video => process::run_video(VideoJob {
                segment: seg.index,
                window,
                input: frame_queues.into_iter().next().map(|(q, _)| q),
                output: self.video_out.clone(),
                epoch,
                opts: self.opts.processor.clone(),
                blank: self.blank,
                max_errors: self.opts.decoder.max_consecutive_errors,
                truncated,
                cancel: seg_cancel.clone(),
            }),
        };
        if let Err(e) = result {
            tracing::error!(segment = seg.index, %kind, "process error: {e:#}");
            fault.record(e);
        }

        // Everything upstream is finished or must stop now.
        seg_cancel.cancel();
        for t in threads {
            if t.join().is_err() {
                fault.record(PlayerError::Inconsistent(format!(
                    "stage thread of segment {} panicked",
                    seg.index
                )));
            }
        }

        match fault.take() {
            Some(e) => SegmentOutcome::Failed(e),
            None if cancel.is_cancelled() => SegmentOutcome::Cancelled,
            None => SegmentOutcome::Completed,
        }
    }
}

/// Tracks of `kind` a segment plays, with mix weights; the primary comes first.
fn lane_tracks(seg: &ResolvedSegment, kind: TrackKind) -> Vec<(Track, f32)> {
    let ResolvedKind::Source {
        tracks, selection, ..
    } = &seg.kind
    else {
        return Vec::new();
    };
    let find = |id| tracks.iter().find(|t| t.id == id).cloned();
    let mut out: Vec<(Track, f32)> = selection
        .get(kind)
        .and_then(find)
        .map(|t| (t, 1.0))
        .into_iter()
        .collect();
    if kind == TrackKind::Audio {
        for aux in &selection.auxiliary_audio {
            if out.iter().any(|(t, _)| t.id == aux.track) {
                continue;
            }
            if let Some(t) = find(aux.track) {
                out.push((t, aux.weight));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemTimeSource;
    use crate::decoder::CompositeDecoderFactory;
    use crate::queue::Popped;
    use crate::source::SyntheticOpener;

    fn pipeline(asset: Asset) -> Pipeline {
        let mut opts = PlayerOptions::default();
        opts.processor.sample_rate = 8_000;
        opts.processor.channels = 1;
        opts.buffering.output_audio_seconds = 60.0;
        opts.buffering.output_video_frames = 10_000;
        let opener: Arc<dyn SourceOpener> = Arc::new(SyntheticOpener);
        let timeline = Timeline::resolve(&asset, opener.as_ref(), &opts.demuxer).unwrap();
        let clock = Arc::new(Clock::new(opts.clock.clone(), Arc::new(SystemTimeSource)));
        Pipeline::new(
            asset,
            timeline,
            opts,
            opener,
            Arc::new(CompositeDecoderFactory),
            clock,
            EventBus::new(),
        )
    }

    fn audio_frames(p: &Pipeline) -> Vec<AudioFrame> {
        let mut out = Vec::new();
        while let Some(s) = p.audio_out.try_pop() {
            out.push(s.frame);
        }
        out
    }

    #[test]
    fn audio_segment_is_produced_gaplessly_to_its_end() {
        let asset = Asset::from_url("synth://?duration=1&audio=8000x1");
        let p = pipeline(asset);
        let seg = p.segment(0).unwrap();
        let outcome = p.run_segment(TrackKind::Audio, &seg, MediaTime::ZERO, 0, &CancelToken::new());
        assert!(matches!(outcome, SegmentOutcome::Completed));
        let frames = audio_frames(&p);
        let total: usize = frames.iter().map(AudioFrame::frames).sum();
        assert_eq!(total, 8_000);
        assert!(frames.windows(2).all(|w| (w[1].pts - w[0].end()).abs() <= MediaTime::from_micros(1)));
    }

    #[test]
    fn padding_produces_silence_and_a_blank_picture() {
        let asset = Asset::builder()
            .url("synth://?duration=1&audio=8000x1")
            .padding(MediaTime::from_millis(500))
            .build()
            .unwrap();
        let p = pipeline(asset);
        let seg = p.segment(1).unwrap();
        let cancel = CancelToken::new();
        assert!(matches!(
            p.run_segment(TrackKind::Audio, &seg, seg.start, 0, &cancel),
            SegmentOutcome::Completed
        ));
        assert!(matches!(
            p.run_segment(TrackKind::Video, &seg, seg.start, 0, &cancel),
            SegmentOutcome::Completed
        ));
        let audio = audio_frames(&p);
        assert_eq!(audio.first().unwrap().pts, MediaTime::from_secs(1));
        assert_eq!(audio.iter().map(AudioFrame::frames).sum::<usize>(), 4_000);
        match p.video_out.pop(&cancel) {
            Popped::Item(s) => {
                assert!(s.frame.blank);
                assert_eq!(s.frame.duration, MediaTime::from_millis(500));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn demux_failure_fails_only_its_segment() {
        let asset = Asset::from_url("synth://?duration=2&audio=8000x1&fail_at=1");
        let p = pipeline(asset);
        let seg = p.segment(0).unwrap();
        match p.run_segment(TrackKind::Audio, &seg, MediaTime::ZERO, 0, &CancelToken::new()) {
            SegmentOutcome::Failed(e) => {
                assert!(e.is_recoverable());
                assert_eq!(e.context().segment, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Every packet demuxed before the failure plays, then nothing up to the segment end.
        let frames = audio_frames(&p);
        assert_eq!(frames.first().unwrap().pts, MediaTime::ZERO);
        assert!(frames.windows(2).all(|w| (w[1].pts - w[0].end()).abs() <= MediaTime::from_micros(1)));
        assert_eq!(frames.iter().map(AudioFrame::frames).sum::<usize>(), 8_192);
        assert_eq!(frames.last().unwrap().end(), MediaTime::from_samples(8_192, 8_000));
    }

    #[test]
    fn cancelled_segment_reports_cancellation() {
        let p = pipeline(Asset::from_url("synth://?duration=2&audio=8000x1"));
        let seg = p.segment(0).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            p.run_segment(TrackKind::Audio, &seg, MediaTime::ZERO, 0, &cancel),
            SegmentOutcome::Cancelled
        ));
    }

    #[test]
    fn lanes_end_with_the_worst_reason() {
        let p = pipeline(Asset::from_url("synth://?duration=1"));
        let kinds = [TrackKind::Audio, TrackKind::Video];
        assert_eq!(p.end_reason(&kinds), None);
        p.finish_lane(TrackKind::Audio, PlaybackEndReason::Eof);
        assert_eq!(p.end_reason(&kinds), None);
        p.finish_lane(TrackKind::Video, PlaybackEndReason::Error);
        assert_eq!(p.end_reason(&kinds), Some(PlaybackEndReason::Error));
        assert!(p.audio_out.is_closed());
        p.reset_run(&[TrackKind::Video]);
        assert_eq!(p.end_reason(&[TrackKind::Audio]), Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn auxiliary_tracks_follow_the_primary() {
        let p = pipeline(Asset::from_url("synth://?duration=1&aux=1"));
        let seg = p.segment(0).unwrap();
        let mut selection = seg.selection();
        selection.auxiliary_audio.push(crate::track::AuxiliaryTrack {
            track: TrackId(3),
            weight: 0.5,
        });
        let seg = ResolvedSegment {
            kind: match seg.kind {
                ResolvedKind::Source { url, source_start, tracks, .. } => ResolvedKind::Source {
                    url,
                    source_start,
                    tracks,
                    selection,
                },
                ResolvedKind::Padding => unreachable!(),
            },
            ..seg
        };
        let tracks = lane_tracks(&seg, TrackKind::Audio);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].1, 0.5);
        assert_eq!(lane_tracks(&seg, TrackKind::Video).len(), 1);
    }
}
