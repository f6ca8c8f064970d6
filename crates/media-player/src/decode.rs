//! Decode stage: packets of one track in, frames in presentation order out.
//!
//! Corrupt packets are skipped; after a failed picture the stage waits for the next
//! keyframe instead of feeding the engine pictures whose references are gone. Only a
//! run of failures longer than the configured threshold fails the segment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cancel::CancelToken;
use crate::config::DecoderOptions;
use crate::decoder::DecoderFactory;
use crate::error::{ErrorContext, Result};
use crate::frame::{Frame, Packet};
use crate::queue::{Popped, StageQueue};
use crate::time::MediaTime;
use crate::track::{Track, TrackKind};

/// Restores presentation order for engines that emit frames in decode order.
///
/// Up to `depth` frames are held back; anything that would still go out behind a
/// frame already released is dropped.
#[derive(Debug)]
pub struct ReorderBuffer {
    depth: usize,
    pending: Vec<Frame>,
    last_out: Option<MediaTime>,
    dropped: u64,
}

impl ReorderBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            pending: Vec::with_capacity(depth + 1),
            last_out: None,
            dropped: 0,
        }
    }

    /// Frames dropped for arriving too late to be ordered.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Add a decoded frame; returns the frames that are now safe to release.
    pub fn push(&mut self, frame: Frame) -> Vec<Frame> {
        let pts = frame.pts();
        let at = self.pending.partition_point(|f| f.pts() <= pts);
        self.pending.insert(at, frame);
        let excess = self.pending.len().saturating_sub(self.depth);
        let ready: Vec<Frame> = self.pending.drain(..excess).collect();
        self.release(ready)
    }

    /// Release everything held back.
    pub fn drain(&mut self) -> Vec<Frame> {
        let ready = std::mem::take(&mut self.pending);
        self.release(ready)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_out = None;
    }

    fn release(&mut self, frames: Vec<Frame>) -> Vec<Frame> {
        let mut out = Vec::with_capacity(frames.len());
        for f in frames {
            if self.last_out.is_some_and(|last| f.pts() < last) {
                self.dropped += 1;
                tracing::debug!(pts = %f.pts(), "dropping frame decoded too late to reorder");
                continue;
            }
            self.last_out = Some(f.pts());
            out.push(f);
        }
        out
    }
}

pub(crate) struct DecodeJob {
    pub segment: usize,
    pub track: Track,
    pub input: Arc<StageQueue<Packet>>,
    pub output: Arc<StageQueue<Frame>>,
    pub factory: Arc<dyn DecoderFactory>,
    pub opts: DecoderOptions,
    /// Item-wide count of skipped packets.
    pub errors: Arc<AtomicU64>,
    pub cancel: CancelToken,
}

/// Decode until the packet queue closes or the job is cancelled.
pub(crate) fn run(job: DecodeJob) -> Result<()> {
    let ctx = ErrorContext::segment(job.segment).with_track(job.track.id);
    let mut engine = job
        .factory
        .make(&job.track, &job.opts)
        .map_err(|e| e.in_context(ctx))?;
    let is_video = job.track.kind() == TrackKind::Video;
    let mut reorder = ReorderBuffer::new(if is_video {
        job.opts.video_reorder_depth
    } else {
        0
    });
    let push = |frame: Frame| job.output.push(frame, &job.cancel).is_ok();

    let mut consecutive = 0u32;
    let mut awaiting_key = false;
    let mut skipped = 0u64;
    let mut decoded = 0u64;
    loop {
        let packet = match job.input.pop(&job.cancel) {
            Popped::Item(p) => p,
            Popped::TimedOut => continue,
            Popped::Closed => break,
            Popped::Cancelled => return Ok(()),
        };
        if awaiting_key && !packet.keyframe {
            skipped += 1;
            continue;
        }
        match engine.decode(&packet) {
            Ok(frames) => {
                consecutive = 0;
                awaiting_key = false;
                for frame in frames {
                    decoded += 1;
                    if !reorder.push(frame).into_iter().all(push) {
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                consecutive += 1;
                job.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    segment = job.segment,
                    track = %job.track.id,
                    pts = %packet.pts,
                    consecutive,
                    "skipping packet: {e}"
                );
                if consecutive > job.opts.max_consecutive_errors {
                    return Err(e.in_context(ctx));
                }
                if is_video && !packet.keyframe {
                    engine.reset();
                }
                awaiting_key = is_video;
            }
        }
    }

    let tail = engine.flush().map_err(|e| e.in_context(ctx))?;
    for frame in tail {
        if !reorder.push(frame).into_iter().all(push) {
            return Ok(());
        }
    }
    if !reorder.drain().into_iter().all(push) {
        return Ok(());
    }
    tracing::debug!(
        segment = job.segment,
        track = %job.track.id,
        decoded,
        skipped,
        reordered_out = reorder.dropped(),
        "decode finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CompositeDecoderFactory;
    use crate::error::PlayerError;
    use crate::frame::{AudioDescriptor, PixelFormat, SampleFormat, VideoDescriptor, VideoFrame};
    use crate::track::{CodecInfo, TrackDescriptor, TrackId};

    fn picture(ms: i64) -> Frame {
        Frame::Video(VideoFrame {
            pts: MediaTime::from_millis(ms),
            duration: MediaTime::from_millis(40),
            descriptor: VideoDescriptor::new(1, 1, PixelFormat::Gray8),
            data: Arc::from(vec![0u8]),
            blank: false,
        })
    }

    fn pts(frames: &[Frame]) -> Vec<i64> {
        frames.iter().map(|f| f.pts().as_millis()).collect()
    }

    #[test]
    fn reorder_buffer_restores_presentation_order() {
        let mut rb = ReorderBuffer::new(2);
        let mut out = Vec::new();
        for ms in [0, 120, 40, 80, 240, 160, 200] {
            out.extend(rb.push(picture(ms)));
        }
        out.extend(rb.drain());
        assert_eq!(pts(&out), vec![0, 40, 80, 120, 160, 200, 240]);
    }

    #[test]
    fn reorder_buffer_drops_frames_behind_the_output() {
        let mut rb = ReorderBuffer::new(1);
        let mut out = Vec::new();
        for ms in [0, 80, 120, 40] {
            out.extend(rb.push(picture(ms)));
        }
        out.extend(rb.drain());
        assert_eq!(pts(&out), vec![0, 80, 120]);
        assert_eq!(rb.dropped(), 1);
    }

    #[test]
    fn zero_depth_passes_straight_through() {
        let mut rb = ReorderBuffer::new(0);
        assert_eq!(pts(&rb.push(picture(40))), vec![40]);
        assert_eq!(pts(&rb.push(picture(80))), vec![80]);
    }

    fn pcm_track() -> Track {
        Track {
            id: TrackId(1),
            codec: CodecInfo::named("pcm_f32le"),
            descriptor: TrackDescriptor::Audio(AudioDescriptor::new(8_000, 1, SampleFormat::F32)),
            language: None,
        }
    }

    fn pcm_packet(index: i64, corrupt: bool) -> Packet {
        let data = if corrupt {
            vec![0; 3]
        } else {
            [0.25f32; 80].iter().flat_map(|s| s.to_le_bytes()).collect()
        };
        Packet {
            track: TrackId(1),
            dts: MediaTime::from_millis(index * 10),
            pts: MediaTime::from_millis(index * 10),
            duration: MediaTime::from_millis(10),
            keyframe: true,
            data,
        }
    }

    fn job(track: Track, packets: Vec<Packet>, max_errors: u32) -> (DecodeJob, Arc<StageQueue<Frame>>) {
        let input = Arc::new(StageQueue::new("packets", 1, 1 << 30));
        let cancel = CancelToken::new();
        for p in packets {
            input.push(p, &cancel).unwrap();
        }
        input.close();
        let output = Arc::new(StageQueue::new("frames", 1, 1 << 30));
        let job = DecodeJob {
            segment: 0,
            track,
            input,
            output: output.clone(),
            factory: Arc::new(CompositeDecoderFactory),
            opts: DecoderOptions {
                max_consecutive_errors: max_errors,
                ..DecoderOptions::default()
            },
            errors: Arc::new(AtomicU64::new(0)),
            cancel,
        };
        (job, output)
    }

    fn drain(q: &StageQueue<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(f) = q.try_pop() {
            out.push(f);
        }
        out
    }

    #[test]
    fn corrupt_packets_are_skipped() {
        let packets = (0..10).map(|i| pcm_packet(i, i % 3 == 1)).collect();
        let (job, output) = job(pcm_track(), packets, 2);
        let errors = job.errors.clone();
        run(job).unwrap();
        assert_eq!(pts(&drain(&output)), vec![0, 20, 30, 50, 60, 80, 90]);
        assert_eq!(errors.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn long_error_runs_fail_the_segment() {
        let packets = (0..10).map(|i| pcm_packet(i, i >= 2)).collect();
        let (job, output) = job(pcm_track(), packets, 3);
        let err = run(job).unwrap_err();
        assert!(matches!(err, PlayerError::Decode { .. }));
        assert_eq!(err.context().track, Some(TrackId(1)));
        assert_eq!(drain(&output).len(), 2);
    }

    #[test]
    fn video_waits_for_keyframe_after_corruption() {
        let desc = VideoDescriptor::new(2, 2, PixelFormat::Yuv420p);
        let track = Track {
            id: TrackId(2),
            codec: CodecInfo::named("raw_video"),
            descriptor: TrackDescriptor::Video(desc),
            language: None,
        };
        let packets = (0..8)
            .map(|i| Packet {
                track: TrackId(2),
                dts: MediaTime::from_millis(i * 40),
                pts: MediaTime::from_millis(i * 40),
                duration: MediaTime::from_millis(40),
                keyframe: i % 4 == 0,
                data: if i == 1 { vec![0; 2] } else { vec![16; desc.frame_size()] },
            })
            .collect();
        let (job, output) = job(track, packets, 1);
        run(job).unwrap();
        assert_eq!(pts(&drain(&output)), vec![0, 160, 200, 240, 280]);
    }
}
