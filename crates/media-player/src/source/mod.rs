//! Source collaborators: open a URL, list its tracks, read packets, seek.
//!
//! - [`SymphoniaOpener`]: local files read with symphonia
//! - [`SyntheticOpener`]: `synth://` test streams with fault injection
//! - [`CompositeOpener`]: routes by URL scheme

mod file;
mod synthetic;

pub use self::file::SymphoniaOpener;
pub use self::synthetic::{SynthParams, SyntheticOpener};

use crate::config::DemuxerOptions;
use crate::error::Result;
use crate::frame::Packet;
use crate::time::MediaTime;
use crate::track::Track;

/// An opened, demuxable source.
///
/// Packet timestamps are on the source's own timeline; the demux stage maps them
/// onto the asset timeline.
pub trait Demuxable: Send {
    fn tracks(&self) -> &[Track];

    /// Total source duration, when the container knows it.
    fn duration(&self) -> Option<MediaTime>;

    /// Next packet in container order; `Ok(None)` at end of stream.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Reposition so the next packets decode into frames at or before `to`.
    ///
    /// Returns the position actually reached, which may be earlier (a keyframe).
    fn seek(&mut self, to: MediaTime) -> Result<MediaTime>;
}

/// Factory for [`Demuxable`] handles.
pub trait SourceOpener: Send + Sync {
    fn open(&self, url: &str, opts: &DemuxerOptions) -> Result<Box<dyn Demuxable>>;
}

/// Default opener: `synth://` URLs go to the synthetic source, everything else to symphonia.
#[derive(Clone, Debug, Default)]
pub struct CompositeOpener {
    synthetic: SyntheticOpener,
    files: SymphoniaOpener,
}

impl CompositeOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceOpener for CompositeOpener {
    fn open(&self, url: &str, opts: &DemuxerOptions) -> Result<Box<dyn Demuxable>> {
        if url.starts_with(synthetic::SCHEME) {
            self.synthetic.open(url, opts)
        } else {
            self.files.open(url, opts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlayerError;

    #[test]
    fn composite_routes_synthetic_urls() {
        let opener = CompositeOpener::new();
        let src = opener
            .open("synth://?duration=1", &DemuxerOptions::default())
            .unwrap();
        assert_eq!(src.duration(), Some(MediaTime::from_secs(1)));
    }

    #[test]
    fn composite_reports_missing_files_as_source_errors() {
        let opener = CompositeOpener::new();
        let err = opener
            .open("/nonexistent/clip.flac", &DemuxerOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, PlayerError::Source { .. }));
    }
}
