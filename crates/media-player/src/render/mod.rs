//! Renderer collaborators.
//!
//! A renderer consumes processed frames paced by the clock. `present` gets the
//! wall time the clock wants the frame to start and returns when it actually
//! starts; the difference feeds the clock's drift accounting.

use std::time::Instant;

use crate::error::Result;
use crate::frame::{AudioDescriptor, AudioFrame, VideoFrame};

pub mod device;
pub mod memory;
pub mod output;

pub use memory::{
    MemoryAudioRenderer, MemoryVideoRenderer, NullAudioRenderer, NullVideoRenderer,
    PresentedAudio, PresentedVideo, Recording,
};
pub use output::{CpalAudioRenderer, OutputOptions};

pub trait AudioRenderer: Send {
    /// Interleaved `f32` format frames must arrive in.
    fn output_descriptor(&self) -> AudioDescriptor;

    /// Queue `frame` for output; returns when its first sample will be heard.
    fn present(&mut self, frame: &AudioFrame, when: Instant) -> Result<Instant>;

    /// Paused output is silence; queued audio is kept, not skipped.
    fn set_paused(&mut self, paused: bool);

    /// Linear gain in `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32);

    /// Drop queued audio, e.g. after a seek.
    fn flush(&mut self);

    /// Underrun events seen by the output so far.
    fn underruns(&self) -> u64 {
        0
    }
}

pub trait VideoRenderer: Send {
    /// Show `frame` at `when`; returns when it was actually shown.
    fn present(&mut self, frame: &VideoFrame, when: Instant) -> Result<Instant>;

    fn flush(&mut self) {}
}
