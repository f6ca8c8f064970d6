//! Demux stage: pull packets of the selected tracks out of a segment's source.
//!
//! Packet timestamps are mapped from the source timeline onto the asset timeline
//! and routed to one bounded queue per track. The stage ends when every routed
//! track has passed the end of the segment or the source runs dry; both are
//! normal termination, not errors.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::capacity::GateError;
use crate::config::DemuxerOptions;
use crate::error::{ErrorContext, Result};
use crate::frame::Packet;
use crate::queue::StageQueue;
use crate::source::SourceOpener;
use crate::time::MediaTime;
use crate::timeline::ResolvedSegment;
use crate::track::TrackId;

pub(crate) struct DemuxJob {
    pub segment: ResolvedSegment,
    /// Asset time to start from; at or after the segment start.
    pub from: MediaTime,
    pub routes: Vec<(TrackId, Arc<StageQueue<Packet>>)>,
    pub opener: Arc<dyn SourceOpener>,
    pub opts: DemuxerOptions,
    pub cancel: CancelToken,
}

struct Route {
    track: TrackId,
    queue: Arc<StageQueue<Packet>>,
    last_dts: Option<MediaTime>,
    done: bool,
    packets: u64,
}

/// Demux until the segment ends, the source is exhausted, or the job is cancelled.
///
/// Open, read and seek failures are returned with segment context; the caller
/// closes the packet queues either way.
pub(crate) fn run(job: DemuxJob) -> Result<()> {
    let seg = &job.segment;
    let ctx = ErrorContext::segment(seg.index);
    let Some(url) = seg.url() else {
        return Ok(());
    };
    let mut routes: Vec<Route> = job
        .routes
        .iter()
        .map(|(track, queue)| Route {
            track: *track,
            queue: queue.clone(),
            last_dts: None,
            done: false,
            packets: 0,
        })
        .collect();
    if routes.is_empty() {
        return Ok(());
    }

    let mut source = job.opener.open(url, &job.opts).map_err(|e| e.in_context(ctx))?;
    let source_from = seg.to_source_time(job.from);
    if source_from > MediaTime::ZERO {
        let reached = source.seek(source_from).map_err(|e| e.in_context(ctx))?;
        tracing::debug!(segment = seg.index, target = %source_from, reached = %reached, "source seek");
    }
    tracing::info!(segment = seg.index, url, tracks = routes.len(), "demux started");

    let end = seg.end();
    while !job.cancel.is_cancelled() {
        let Some(mut packet) = source.read_packet().map_err(|e| e.in_context(ctx))? else {
            tracing::debug!(segment = seg.index, "source exhausted");
            break;
        };
        let Some(route) = routes.iter_mut().find(|r| r.track == packet.track) else {
            continue;
        };
        if route.done {
            continue;
        }
        packet.pts = seg.to_asset_time(packet.pts);
        packet.dts = seg.to_asset_time(packet.dts);
        if packet.dts >= end {
            route.done = true;
            if routes.iter().all(|r| r.done) {
                break;
            }
            continue;
        }
        if route.last_dts.is_some_and(|last| packet.dts < last) {
            tracing::debug!(segment = seg.index, track = %packet.track, dts = %packet.dts, "dropping out-of-order packet");
            continue;
        }
        // Reordered pictures can carry a pts past the end even though their dts is inside.
        if packet.pts >= end {
            continue;
        }
        route.last_dts = Some(packet.dts);
        match route.queue.push(packet, &job.cancel) {
            Ok(()) => route.packets += 1,
            Err(GateError::Cancelled) => return Ok(()),
            Err(GateError::Closed) => {
                route.done = true;
                if routes.iter().all(|r| r.done) {
                    break;
                }
            }
        }
    }

    for r in &routes {
        tracing::debug!(segment = seg.index, track = %r.track, packets = r.packets, "demux finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlayerError;
    use crate::source::{Demuxable, SyntheticOpener};
    use crate::timeline::ResolvedKind;
    use crate::track::TrackSelection;

    fn segment(url: &str, start: MediaTime, source_start: MediaTime, duration: MediaTime) -> ResolvedSegment {
        let src = SyntheticOpener.open(url, &DemuxerOptions::default()).unwrap();
        let tracks = src.tracks().to_vec();
        ResolvedSegment {
            index: 1,
            start,
            duration,
            kind: ResolvedKind::Source {
                url: url.to_string(),
                selection: TrackSelection::default_for(&tracks),
                tracks,
                source_start,
            },
        }
    }

    fn job(segment: ResolvedSegment, from: MediaTime, tracks: &[TrackId]) -> (DemuxJob, Vec<Arc<StageQueue<Packet>>>) {
        let queues: Vec<_> = tracks
            .iter()
            .map(|_| Arc::new(StageQueue::new("packets", 1, 1 << 30)))
            .collect();
        let job = DemuxJob {
            segment,
            from,
            routes: tracks.iter().copied().zip(queues.iter().cloned()).collect(),
            opener: Arc::new(SyntheticOpener),
            opts: DemuxerOptions::default(),
            cancel: CancelToken::new(),
        };
        (job, queues)
    }

    fn drain(q: &StageQueue<Packet>) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(p) = q.try_pop() {
            out.push(p);
        }
        out
    }

    #[test]
    fn packets_are_mapped_onto_the_asset_timeline_and_cut_at_the_end() {
        let seg = segment(
            "synth://?duration=4&audio=8000x1",
            MediaTime::from_secs(5),
            MediaTime::from_secs(1),
            MediaTime::from_secs(2),
        );
        let (job, queues) = job(seg, MediaTime::from_secs(5), &[TrackId(1), TrackId(2)]);
        run(job).unwrap();
        for q in &queues {
            let packets = drain(q);
            assert!(!packets.is_empty());
            assert!(packets.iter().all(|p| p.pts < MediaTime::from_secs(7)));
            assert!(packets.windows(2).all(|w| w[0].dts <= w[1].dts));
            let last = packets.last().unwrap();
            assert!(last.pts + last.duration >= MediaTime::from_millis(6_900));
        }
    }

    #[test]
    fn starts_from_a_seek_position() {
        let seg = segment(
            "synth://?duration=10&audio=0",
            MediaTime::ZERO,
            MediaTime::ZERO,
            MediaTime::from_secs(10),
        );
        let (job, queues) = job(seg, MediaTime::from_secs(3), &[TrackId(2)]);
        run(job).unwrap();
        let first = drain(&queues[0]).into_iter().next().unwrap();
        assert!(first.keyframe);
        assert!(first.pts <= MediaTime::from_secs(3));
        assert!(first.pts > MediaTime::from_millis(2_400));
    }

    #[test]
    fn reordered_video_keeps_decode_order() {
        let seg = segment(
            "synth://?duration=2&audio=0&reorder=1",
            MediaTime::ZERO,
            MediaTime::ZERO,
            MediaTime::from_secs(2),
        );
        let (job, queues) = job(seg, MediaTime::ZERO, &[TrackId(2)]);
        run(job).unwrap();
        let packets = drain(&queues[0]);
        assert!(packets.windows(2).all(|w| w[0].dts <= w[1].dts));
        assert!(packets.windows(2).any(|w| w[1].pts < w[0].pts));
    }

    #[test]
    fn failure_carries_segment_context() {
        let seg = segment(
            "synth://?duration=4&fail_at=1",
            MediaTime::ZERO,
            MediaTime::ZERO,
            MediaTime::from_secs(4),
        );
        let (job, queues) = job(seg, MediaTime::ZERO, &[TrackId(1)]);
        let err = run(job).unwrap_err();
        assert!(matches!(err, PlayerError::Demux { .. }));
        assert_eq!(err.context().segment, Some(1));
        assert!(!drain(&queues[0]).is_empty());
    }

    #[test]
    fn cancelled_job_returns_promptly() {
        let seg = segment("synth://?duration=4", MediaTime::ZERO, MediaTime::ZERO, MediaTime::from_secs(4));
        let (job, queues) = job(seg, MediaTime::ZERO, &[TrackId(1)]);
        job.cancel.cancel();
        run(job).unwrap();
        assert!(queues[0].is_empty());
    }
}
