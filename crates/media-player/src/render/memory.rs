//! Renderers that keep no device: recording ones for tests and dry runs, and
//! null ones that discard.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::clock::TimeSource;
use crate::error::Result;
use crate::frame::{AudioDescriptor, AudioFrame, VideoFrame};
use crate::render::{AudioRenderer, VideoRenderer};
use crate::time::MediaTime;

/// Shared log of presentations, readable while the renderer is owned by a player.
#[derive(Debug)]
pub struct Recording<T> {
    entries: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recording<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for Recording<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recording<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, entry: T) {
        self.lock().push(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PresentedAudio {
    pub pts: MediaTime,
    /// Content covered, after time-stretching.
    pub content: MediaTime,
    pub frames: usize,
    pub rate: f64,
    pub at: Instant,
    pub gain: f32,
    pub peak: f32,
}

impl PresentedAudio {
    pub fn end(&self) -> MediaTime {
        self.pts + self.content
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PresentedVideo {
    pub pts: MediaTime,
    pub at: Instant,
    pub width: u32,
    pub height: u32,
    pub blank: bool,
}

/// Plays audio into a log, pacing it like a device would.
pub struct MemoryAudioRenderer {
    descriptor: AudioDescriptor,
    time: Arc<dyn TimeSource>,
    log: Recording<PresentedAudio>,
    /// Wall time the queued audio runs out.
    cursor: Option<Instant>,
    paused_at: Option<Instant>,
    gain: f32,
}

impl MemoryAudioRenderer {
    pub fn new(descriptor: AudioDescriptor, time: Arc<dyn TimeSource>) -> Self {
        Self {
            descriptor,
            time,
            log: Recording::default(),
            cursor: None,
            paused_at: None,
            gain: 1.0,
        }
    }

    pub fn recording(&self) -> Recording<PresentedAudio> {
        self.log.clone()
    }
}

impl AudioRenderer for MemoryAudioRenderer {
    fn output_descriptor(&self) -> AudioDescriptor {
        self.descriptor
    }

    fn present(&mut self, frame: &AudioFrame, when: Instant) -> Result<Instant> {
        let now = self.time.now();
        let at = self.cursor.map_or(when, |c| c.max(when)).max(now);
        self.cursor = Some(at + frame.duration.to_duration());
        let peak = frame
            .samples
            .to_f32()
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        self.log.push(PresentedAudio {
            pts: frame.pts,
            content: frame.content_duration(),
            frames: frame.frames(),
            rate: frame.rate,
            at,
            gain: self.gain,
            peak,
        });
        Ok(at)
    }

    fn set_paused(&mut self, paused: bool) {
        let now = self.time.now();
        match (paused, self.paused_at) {
            (true, None) => self.paused_at = Some(now),
            (false, Some(since)) => {
                self.paused_at = None;
                if let Some(c) = self.cursor.as_mut() {
                    if *c > since {
                        *c += now - since;
                    }
                }
            }
            _ => {}
        }
    }

    fn set_volume(&mut self, volume: f32) {
        self.gain = volume.clamp(0.0, 1.0);
    }

    fn flush(&mut self) {
        self.cursor = None;
    }
}

/// Shows frames into a log.
pub struct MemoryVideoRenderer {
    time: Arc<dyn TimeSource>,
    log: Recording<PresentedVideo>,
}

impl MemoryVideoRenderer {
    pub fn new(time: Arc<dyn TimeSource>) -> Self {
        Self {
            time,
            log: Recording::default(),
        }
    }

    pub fn recording(&self) -> Recording<PresentedVideo> {
        self.log.clone()
    }
}

impl VideoRenderer for MemoryVideoRenderer {
    fn present(&mut self, frame: &VideoFrame, when: Instant) -> Result<Instant> {
        let at = when.max(self.time.now());
        self.log.push(PresentedVideo {
            pts: frame.pts,
            at,
            width: frame.descriptor.width,
            height: frame.descriptor.height,
            blank: frame.blank,
        });
        Ok(at)
    }
}

/// Accepts audio instantly and discards it.
#[derive(Clone, Copy, Debug)]
pub struct NullAudioRenderer {
    descriptor: AudioDescriptor,
}

impl NullAudioRenderer {
    pub fn new(descriptor: AudioDescriptor) -> Self {
        Self { descriptor }
    }
}

impl AudioRenderer for NullAudioRenderer {
    fn output_descriptor(&self) -> AudioDescriptor {
        self.descriptor
    }

    fn present(&mut self, _frame: &AudioFrame, when: Instant) -> Result<Instant> {
        Ok(when)
    }

    fn set_paused(&mut self, _paused: bool) {}

    fn set_volume(&mut self, _volume: f32) {}

    fn flush(&mut self) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullVideoRenderer;

impl VideoRenderer for NullVideoRenderer {
    fn present(&mut self, _frame: &VideoFrame, when: Instant) -> Result<Instant> {
        Ok(when)
    }
}
