//! Assets, segments and the resolved presentation timeline.
//!
//! An [`Asset`] is what the caller describes: an ordered list of [`Segment`]s, some of
//! which may not know their duration yet. Preparing a player resolves it into a
//! [`Timeline`] where every segment has a fixed start and duration on the asset
//! timeline, and source segments know their tracks and active selection.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DemuxerOptions;
use crate::error::{ErrorContext, PlayerError, Result};
use crate::source::SourceOpener;
use crate::time::MediaTime;
use crate::track::{Track, TrackKind, TrackSelection};

/// Slice of a demuxable source placed on the asset timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSegment {
    pub url: String,
    /// Offset into the source where this segment begins.
    pub source_start: MediaTime,
    /// Length on the asset timeline; `None` runs to the end of the source.
    pub duration: Option<MediaTime>,
    /// Tracks to play; `None` picks the first audio and first video track.
    pub selection: Option<TrackSelection>,
}

impl SourceSegment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_start: MediaTime::ZERO,
            duration: None,
            selection: None,
        }
    }

    pub fn range(mut self, source_start: MediaTime, duration: MediaTime) -> Self {
        self.source_start = source_start;
        self.duration = Some(duration);
        self
    }

    pub fn with_selection(mut self, selection: TrackSelection) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// Gap on the timeline filled with silence and blank pictures.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PaddingSegment {
    pub duration: MediaTime,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Source(SourceSegment),
    Padding(PaddingSegment),
}

impl Segment {
    pub fn url(url: impl Into<String>) -> Self {
        Segment::Source(SourceSegment::new(url))
    }

    pub fn padding(duration: MediaTime) -> Self {
        Segment::Padding(PaddingSegment { duration })
    }

    /// Declared duration, if known before the source is opened.
    pub fn duration(&self) -> Option<MediaTime> {
        match self {
            Segment::Source(s) => s.duration,
            Segment::Padding(p) => Some(p.duration),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Segment::Padding(p) if p.duration <= MediaTime::ZERO => Err(
                PlayerError::Configuration("padding segment needs a positive duration".into()),
            ),
            Segment::Source(s) if s.source_start.is_negative() => Err(
                PlayerError::Configuration(format!("{}: negative source start", s.url)),
            ),
            Segment::Source(s) if matches!(s.duration, Some(d) if d <= MediaTime::ZERO) => Err(
                PlayerError::Configuration(format!("{}: segment duration must be positive", s.url)),
            ),
            _ => Ok(()),
        }
    }
}

/// Ordered, immutable list of segments.
///
/// Assets taken from a [`MutableAsset`] keep a handle to it so segments appended
/// during playback are picked up when the timeline runs out.
#[derive(Clone, Debug, Default)]
pub struct Asset {
    segments: Vec<Segment>,
    growth: Option<MutableAsset>,
}

impl Asset {
    /// Whole source as a single segment.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::url(url)],
            growth: None,
        }
    }

    pub fn builder() -> AssetBuilder {
        AssetBuilder::default()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments appended to the backing mutable asset beyond the first `known`.
    pub(crate) fn appended_after(&self, known: usize) -> Vec<Segment> {
        match &self.growth {
            Some(m) => m.lock().segments.iter().skip(known).cloned().collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AssetBuilder {
    segments: Vec<Segment>,
}

impl AssetBuilder {
    pub fn segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn url(self, url: impl Into<String>) -> Self {
        self.segment(Segment::url(url))
    }

    /// `duration` of `url` starting `source_start` into it.
    pub fn url_range(self, url: impl Into<String>, source_start: MediaTime, duration: MediaTime) -> Self {
        self.segment(Segment::Source(
            SourceSegment::new(url).range(source_start, duration),
        ))
    }

    pub fn padding(self, duration: MediaTime) -> Self {
        self.segment(Segment::padding(duration))
    }

    pub fn build(self) -> Result<Asset> {
        if self.segments.is_empty() {
            return Err(PlayerError::Configuration("asset has no segments".into()));
        }
        for s in &self.segments {
            s.validate()?;
        }
        Ok(Asset {
            segments: self.segments,
            growth: None,
        })
    }
}

/// Asset that can be edited freely until playback starts, then only appended to.
#[derive(Clone, Debug, Default)]
pub struct MutableAsset {
    inner: Arc<Mutex<MutableInner>>,
}

#[derive(Debug, Default)]
struct MutableInner {
    segments: Vec<Segment>,
    frozen: bool,
}

impl MutableAsset {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MutableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, segment: Segment) -> Result<()> {
        segment.validate()?;
        self.lock().segments.push(segment);
        Ok(())
    }

    /// Insert before `index`; rejected once playback has started.
    pub fn insert(&self, index: usize, segment: Segment) -> Result<()> {
        segment.validate()?;
        let mut g = self.lock();
        if g.frozen {
            return Err(PlayerError::Configuration(
                "segments can only be appended while playing".into(),
            ));
        }
        if index > g.segments.len() {
            return Err(PlayerError::Configuration(format!(
                "insert index {index} beyond {} segments",
                g.segments.len()
            )));
        }
        g.segments.insert(index, segment);
        Ok(())
    }

    /// Remove the segment at `index`; rejected once playback has started.
    pub fn remove(&self, index: usize) -> Result<Segment> {
        let mut g = self.lock();
        if g.frozen {
            return Err(PlayerError::Configuration(
                "segments can only be appended while playing".into(),
            ));
        }
        if index >= g.segments.len() {
            return Err(PlayerError::Configuration(format!(
                "no segment at index {index}"
            )));
        }
        Ok(g.segments.remove(index))
    }

    pub fn len(&self) -> usize {
        self.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().segments.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Freeze for playback and take the current segments as an [`Asset`].
    pub fn snapshot(&self) -> Result<Asset> {
        let mut g = self.lock();
        if g.segments.is_empty() {
            return Err(PlayerError::Configuration("asset has no segments".into()));
        }
        g.frozen = true;
        Ok(Asset {
            segments: g.segments.clone(),
            growth: Some(self.clone()),
        })
    }
}

/// What a resolved segment plays.
#[derive(Clone, Debug)]
pub enum ResolvedKind {
    Source {
        url: String,
        source_start: MediaTime,
        tracks: Vec<Track>,
        selection: TrackSelection,
    },
    Padding,
}

/// Segment with a fixed place on the asset timeline.
#[derive(Clone, Debug)]
pub struct ResolvedSegment {
    pub index: usize,
    pub start: MediaTime,
    pub duration: MediaTime,
    pub kind: ResolvedKind,
}

impl ResolvedSegment {
    pub fn end(&self) -> MediaTime {
        self.start + self.duration
    }

    pub fn contains(&self, t: MediaTime) -> bool {
        t >= self.start && t < self.end()
    }

    pub fn is_padding(&self) -> bool {
        matches!(self.kind, ResolvedKind::Padding)
    }

    /// Active selection; empty for padding.
    pub fn selection(&self) -> TrackSelection {
        match &self.kind {
            ResolvedKind::Source { selection, .. } => selection.clone(),
            ResolvedKind::Padding => TrackSelection::default(),
        }
    }

    /// Selected track of `kind` with its descriptor.
    pub fn selected(&self, kind: TrackKind) -> Option<&Track> {
        match &self.kind {
            ResolvedKind::Source {
                tracks, selection, ..
            } => {
                let id = selection.get(kind)?;
                tracks.iter().find(|t| t.id == id)
            }
            ResolvedKind::Padding => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.kind {
            ResolvedKind::Source { url, .. } => Some(url),
            ResolvedKind::Padding => None,
        }
    }

    /// Map a source timestamp onto the asset timeline.
    pub fn to_asset_time(&self, source_time: MediaTime) -> MediaTime {
        match &self.kind {
            ResolvedKind::Source { source_start, .. } => self.start + source_time - *source_start,
            ResolvedKind::Padding => self.start + source_time,
        }
    }

    /// Map an asset time inside this segment to the source timeline.
    pub fn to_source_time(&self, asset_time: MediaTime) -> MediaTime {
        match &self.kind {
            ResolvedKind::Source { source_start, .. } => *source_start + asset_time - self.start,
            ResolvedKind::Padding => asset_time - self.start,
        }
    }
}

/// Contiguous list of resolved segments starting at zero.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    segments: Vec<ResolvedSegment>,
}

impl Timeline {
    /// Open every source segment to learn its tracks and, where not given, its duration.
    ///
    /// A source that cannot be opened is kept when its duration was declared, so that
    /// playback skips it at run time; otherwise its duration is unknowable and
    /// resolution fails.
    pub fn resolve(
        asset: &Asset,
        opener: &dyn SourceOpener,
        opts: &DemuxerOptions,
    ) -> Result<Self> {
        let mut timeline = Timeline::default();
        for segment in asset.segments() {
            let resolved = resolve_segment(
                timeline.segments.len(),
                timeline.duration(),
                segment,
                opener,
                opts,
            )?;
            timeline.push(resolved)?;
        }
        if timeline.segments.is_empty() {
            return Err(PlayerError::Configuration("asset has no segments".into()));
        }
        Ok(timeline)
    }

    /// Resolve and append one segment at the current end of the timeline.
    pub fn append(
        &mut self,
        segment: &Segment,
        opener: &dyn SourceOpener,
        opts: &DemuxerOptions,
    ) -> Result<&ResolvedSegment> {
        segment.validate()?;
        let resolved = resolve_segment(self.segments.len(), self.duration(), segment, opener, opts)?;
        self.push(resolved)?;
        self.segments
            .last()
            .ok_or_else(|| PlayerError::Inconsistent("append lost its segment".into()))
    }

    fn push(&mut self, segment: ResolvedSegment) -> Result<()> {
        let expected = self.duration();
        if segment.start != expected || segment.index != self.segments.len() {
            return Err(PlayerError::Inconsistent(format!(
                "segment {} starts at {} but the timeline ends at {expected}",
                segment.index, segment.start
            )));
        }
        if segment.duration <= MediaTime::ZERO {
            return Err(PlayerError::Configuration(format!(
                "segment {} has no duration",
                segment.index
            )));
        }
        self.segments.push(segment);
        Ok(())
    }

    pub fn duration(&self) -> MediaTime {
        self.segments
            .last()
            .map(ResolvedSegment::end)
            .unwrap_or(MediaTime::ZERO)
    }

    pub fn segments(&self) -> &[ResolvedSegment] {
        &self.segments
    }

    pub fn get(&self, index: usize) -> Option<&ResolvedSegment> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment active at `t`, by binary search over start offsets.
    ///
    /// Segments are half-open `[start, end)`; times before zero or at/after the end
    /// of the asset resolve to nothing.
    pub fn resolve_time(&self, t: MediaTime) -> Option<&ResolvedSegment> {
        if t.is_negative() {
            return None;
        }
        let idx = self.segments.partition_point(|s| s.start <= t);
        let seg = self.segments.get(idx.checked_sub(1)?)?;
        seg.contains(t).then_some(seg)
    }

    /// Whether any segment plays a track of `kind`.
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.segments
            .iter()
            .any(|s| s.selection().get(kind).is_some())
    }

    pub(crate) fn set_selection(
        &mut self,
        index: usize,
        kind: TrackKind,
        track: Option<crate::track::TrackId>,
    ) -> Result<()> {
        let seg = self
            .segments
            .get_mut(index)
            .ok_or_else(|| PlayerError::Configuration(format!("no segment {index}")))?;
        match &mut seg.kind {
            ResolvedKind::Source {
                tracks, selection, ..
            } => {
                let mut next = selection.clone();
                next.set(kind, track);
                next.validate(tracks)?;
                *selection = next;
                Ok(())
            }
            ResolvedKind::Padding => Err(PlayerError::Configuration(format!(
                "segment {index} is padding and has no tracks"
            ))),
        }
    }
}

fn resolve_segment(
    index: usize,
    start: MediaTime,
    segment: &Segment,
    opener: &dyn SourceOpener,
    opts: &DemuxerOptions,
) -> Result<ResolvedSegment> {
    let ctx = ErrorContext::segment(index);
    match segment {
        Segment::Padding(p) => Ok(ResolvedSegment {
            index,
            start,
            duration: p.duration,
            kind: ResolvedKind::Padding,
        }),
        Segment::Source(s) => {
            let (tracks, available) = match opener.open(&s.url, opts) {
                Ok(source) => (
                    source.tracks().to_vec(),
                    source.duration().map(|d| d - s.source_start),
                ),
                Err(e) if s.duration.is_some() => {
                    tracing::warn!(segment = index, url = %s.url, "source open failed: {e:#}");
                    (Vec::new(), None)
                }
                Err(e) => return Err(e.in_context(ctx)),
            };

            let duration = match (s.duration, available) {
                (Some(d), Some(avail)) => {
                    if d > avail {
                        tracing::warn!(
                            segment = index,
                            declared = %d,
                            available = %avail,
                            "segment runs past the end of its source; tail will be padded"
                        );
                    }
                    d
                }
                (Some(d), None) => d,
                (None, Some(avail)) if avail > MediaTime::ZERO => avail,
                _ => {
                    return Err(PlayerError::Configuration(format!(
                        "duration of {} is unknown; give the segment an explicit duration",
                        s.url
                    )));
                }
            };

            let selection = match &s.selection {
                Some(sel) if !tracks.is_empty() => {
                    sel.validate(&tracks)?;
                    sel.clone()
                }
                Some(sel) => sel.clone(),
                None => TrackSelection::default_for(&tracks),
            };

            tracing::debug!(
                segment = index,
                url = %s.url,
                start = %start,
                duration = %duration,
                tracks = tracks.len(),
                "segment resolved"
            );
            Ok(ResolvedSegment {
                index,
                start,
                duration,
                kind: ResolvedKind::Source {
                    url: s.url.clone(),
                    source_start: s.source_start,
                    tracks,
                    selection,
                },
            })
        }
    }
}
