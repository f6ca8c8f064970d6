//! Pull processed frames without a clock or renderer.
//!
//! A [`FrameReader`] drives the same production lanes as a player item but hands
//! frames to the caller instead of pacing them, which suits offline extraction,
//! thumbnails and tests.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use media_player_types::{PlaybackEndReason, TrackKind};

use crate::cancel::{CANCEL_POLL, CancelToken};
use crate::clock::{Clock, SystemTimeSource};
use crate::config::PlayerOptions;
use crate::decoder::{CompositeDecoderFactory, DecoderFactory};
use crate::error::{PlayerError, Result};
use crate::events::{EventBus, PlayerEvent};
use crate::frame::{AudioFrame, Frame, Stamped, VideoFrame};
use crate::pipeline::Pipeline;
use crate::pipeline::producer::Producer;
use crate::queue::{Popped, StageQueue, Weighted};
use crate::source::{CompositeOpener, SourceOpener};
use crate::time::MediaTime;
use crate::timeline::{Asset, Timeline};

pub struct FrameReader {
    pipeline: Arc<Pipeline>,
    kinds: Vec<TrackKind>,
    lanes: Vec<Producer>,
    cancel: CancelToken,
    epoch: u64,
    position: MediaTime,
}

impl FrameReader {
    /// Reader over `asset` with the default sources and decoders.
    pub fn open(asset: Asset, options: PlayerOptions) -> Result<Self> {
        Self::with_collaborators(
            asset,
            options,
            Arc::new(CompositeOpener::new()),
            Arc::new(CompositeDecoderFactory),
        )
    }

    pub fn with_collaborators(
        asset: Asset,
        options: PlayerOptions,
        opener: Arc<dyn SourceOpener>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        options.validate()?;
        let timeline = Timeline::resolve(&asset, opener.as_ref(), &options.demuxer)?;
        let clock = Arc::new(Clock::new(options.clock.clone(), Arc::new(SystemTimeSource)));
        let pipeline = Arc::new(Pipeline::new(
            asset,
            timeline,
            options,
            opener,
            decoders,
            clock,
            EventBus::new(),
        ));
        let kinds = pipeline.kinds();
        Ok(Self {
            pipeline,
            kinds,
            lanes: Vec::new(),
            cancel: CancelToken::new(),
            epoch: 0,
            position: MediaTime::ZERO,
        })
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.pipeline.events.subscribe()
    }

    pub fn duration(&self) -> MediaTime {
        self.pipeline.duration()
    }

    /// Track kinds this reader produces.
    pub fn kinds(&self) -> &[TrackKind] {
        &self.kinds
    }

    /// Why production ended, once every kind has finished.
    pub fn end_reason(&self) -> Option<PlaybackEndReason> {
        if self.lanes.is_empty() {
            return None;
        }
        self.pipeline.end_reason(&self.kinds)
    }

    /// Units buffered ahead of the reader: sample frames for audio, pictures for video.
    pub fn buffered(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Audio => self.pipeline.audio_out.occupancy(),
            TrackKind::Video => self.pipeline.video_out.occupancy(),
        }
    }

    fn ensure_started(&mut self) {
        if !self.lanes.is_empty() {
            return;
        }
        let lead = self.kinds.first().copied();
        for &kind in &self.kinds {
            self.lanes.push(Producer::spawn(
                self.pipeline.clone(),
                kind,
                self.position,
                self.epoch,
                Some(kind) == lead,
                &self.cancel,
            ));
        }
    }

    /// Next audio frame in presentation order; `None` after the last one.
    pub fn read_audio(&mut self) -> Option<AudioFrame> {
        if !self.kinds.contains(&TrackKind::Audio) {
            return None;
        }
        self.ensure_started();
        let frame = next(&self.pipeline.audio_out, self.epoch, &self.cancel);
        self.reached(frame.as_ref().map(|f| f.pts));
        frame
    }

    /// Next video frame in presentation order; `None` after the last one.
    pub fn read_video(&mut self) -> Option<VideoFrame> {
        if !self.kinds.contains(&TrackKind::Video) {
            return None;
        }
        self.ensure_started();
        let frame = next(&self.pipeline.video_out, self.epoch, &self.cancel);
        self.reached(frame.as_ref().map(|f| f.pts));
        frame
    }

    /// Publish segment notifications up to a frame just handed out; all of them
    /// once the kind is exhausted.
    fn reached(&self, pts: Option<MediaTime>) {
        self.pipeline.release_boundaries(pts.unwrap_or(MediaTime::MAX));
    }

    /// Next frame of any kind, earliest presentation time first.
    pub fn read(&mut self) -> Option<Frame> {
        self.ensure_started();
        let p = self.pipeline.clone();
        let audio = self.kinds.contains(&TrackKind::Audio);
        let video = self.kinds.contains(&TrackKind::Video);
        loop {
            // A kind this reader does not produce counts as finished.
            let a = if audio { head(&p.audio_out, |f| f.pts) } else { Head::Done };
            let v = if video { head(&p.video_out, |f| f.pts) } else { Head::Done };
            let pick = match (a, v) {
                (Head::Pts(a), Head::Pts(v)) => Some(if a <= v { TrackKind::Audio } else { TrackKind::Video }),
                (Head::Pts(_), Head::Done) => Some(TrackKind::Audio),
                (Head::Done, Head::Pts(_)) => Some(TrackKind::Video),
                (Head::Done, Head::Done) => return None,
                _ => None,
            };
            match pick {
                Some(TrackKind::Audio) => return self.read_audio().map(Frame::Audio),
                Some(TrackKind::Video) => return self.read_video().map(Frame::Video),
                None => {
                    if a == Head::Waiting {
                        p.audio_out.wait_for_any(CANCEL_POLL);
                    } else {
                        p.video_out.wait_for_any(CANCEL_POLL);
                    }
                }
            }
        }
    }

    /// Discard everything buffered and continue from `target`.
    ///
    /// Production restarts on the next read, so nothing is buffered in between.
    pub fn seek(&mut self, target: MediaTime) -> Result<()> {
        let duration = self.duration();
        if target.is_negative() || target > duration {
            return Err(PlayerError::seek_out_of_range(target, duration));
        }
        self.stop_lanes();
        let p = &self.pipeline;
        p.audio_out.flush()?;
        p.video_out.flush()?;
        p.audio_out.reopen();
        p.video_out.reopen();
        p.reset_run(&self.kinds);
        self.epoch += 1;
        self.position = target;
        tracing::debug!(target = %target, "reader seek");
        Ok(())
    }

    fn stop_lanes(&mut self) {
        for lane in self.lanes.drain(..) {
            lane.stop();
        }
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.stop_lanes();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Head {
    Pts(MediaTime),
    Waiting,
    Done,
}

fn head<T: Weighted>(queue: &StageQueue<Stamped<T>>, pts: impl FnOnce(&T) -> MediaTime) -> Head {
    if let Some(t) = queue.peek_with(|s| pts(&s.frame)) {
        Head::Pts(t)
    } else if queue.is_drained() {
        Head::Done
    } else {
        Head::Waiting
    }
}

fn next<T: Weighted>(queue: &StageQueue<Stamped<T>>, epoch: u64, cancel: &CancelToken) -> Option<T> {
    loop {
        match queue.pop(cancel) {
            Popped::Item(s) if s.epoch == epoch => return Some(s.frame),
            Popped::Item(_) | Popped::TimedOut => continue,
            Popped::Closed | Popped::Cancelled => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticOpener;

    fn reader(url: &str) -> FrameReader {
        let mut options = PlayerOptions::default();
        options.processor.sample_rate = 8_000;
        options.processor.channels = 1;
        FrameReader::with_collaborators(
            Asset::from_url(url),
            options,
            Arc::new(SyntheticOpener),
            Arc::new(CompositeDecoderFactory),
        )
        .unwrap()
    }

    #[test]
    fn reads_every_audio_frame_in_order() {
        let mut r = reader("synth://?duration=1&audio=8000x1&video=0");
        let mut total = 0;
        let mut last = MediaTime::from_micros(-1);
        while let Some(f) = r.read_audio() {
            assert!(f.pts > last);
            last = f.pts;
            total += f.frames();
        }
        assert_eq!(total, 8_000);
        assert_eq!(r.end_reason(), Some(PlaybackEndReason::Eof));
    }

    #[test]
    fn interleaves_kinds_by_presentation_time() {
        let mut r = reader("synth://?duration=1&audio=8000x1&video=32x16@10");
        let mut last = MediaTime::from_micros(-1);
        let mut pictures = 0;
        while let Some(f) = r.read() {
            assert!(f.pts() >= last);
            last = f.pts();
            if matches!(f, Frame::Video(_)) {
                pictures += 1;
            }
        }
        assert_eq!(pictures, 10);
    }

    #[test]
    fn seek_discards_buffered_frames() {
        let mut r = reader("synth://?duration=4&audio=8000x1&video=32x16@25");
        r.read_audio().unwrap();
        r.read_video().unwrap();
        r.seek(MediaTime::from_millis(2_500)).unwrap();
        assert_eq!(r.buffered(TrackKind::Audio), 0);
        assert_eq!(r.buffered(TrackKind::Video), 0);
        assert!(r.read_audio().unwrap().pts >= MediaTime::from_millis(2_500));
        assert!(r.read_video().unwrap().pts >= MediaTime::from_millis(2_500));
    }

    #[test]
    fn segment_notifications_follow_the_frames_read() {
        let mut options = PlayerOptions::default();
        options.processor.sample_rate = 8_000;
        options.processor.channels = 1;
        let asset = Asset::builder()
            .url("synth://a?duration=1&audio=8000x1&video=0")
            .url("synth://b?duration=1&audio=8000x1&video=0")
            .build()
            .unwrap();
        let mut r = FrameReader::with_collaborators(
            asset,
            options,
            Arc::new(SyntheticOpener),
            Arc::new(CompositeDecoderFactory),
        )
        .unwrap();
        let events = r.subscribe();
        while let Some(f) = r.read_audio() {
            let advanced = events
                .try_iter()
                .any(|e| matches!(e, PlayerEvent::SegmentAdvanced { .. }));
            assert_eq!(advanced, f.pts == MediaTime::from_secs(1));
        }
    }

    #[test]
    fn seek_past_the_end_is_rejected() {
        let mut r = reader("synth://?duration=1&audio=8000x1");
        assert!(matches!(r.seek(MediaTime::from_secs(2)), Err(PlayerError::Clock { .. })));
    }
}
