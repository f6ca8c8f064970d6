//! Process stage: decoded frames in, renderer-ready frames out.
//!
//! One audio thread per segment formats every selected audio track to the canonical
//! descriptor, trims it to the segment window, mixes primary and auxiliary tracks
//! and, when the playback rate is not 1, time-stretches the mix. One video thread
//! converts and scales pictures. Both synthesise silence or blank pictures where the
//! segment has nothing to offer, so the output stays gapless across boundaries.

pub mod audio;
pub mod mixer;
pub mod padding;
pub mod resample;
pub mod stretch;
pub mod video;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use self::audio::{AudioFormatter, map_channels};
pub use self::mixer::{AudioMixer, soft_limit};
pub use self::padding::{Silence, blank_frame, blank_picture};
pub use self::resample::StreamResampler;
pub use self::stretch::TimeStretcher;
pub use self::video::VideoConverter;

use crate::cancel::CancelToken;
use crate::config::ProcessorOptions;
use crate::error::{ErrorContext, Result};
use crate::frame::{AudioDescriptor, AudioFrame, AudioSamples, Frame, Stamped, VideoDescriptor, VideoFrame};
use crate::queue::{Popped, StageQueue};
use crate::time::MediaTime;

/// Playback rate shared between the control thread and the audio process thread.
#[derive(Clone, Debug)]
pub struct SharedRate(Arc<AtomicU64>);

impl SharedRate {
    pub fn new(rate: f64) -> Self {
        Self(Arc::new(AtomicU64::new(rate.to_bits())))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }
}

impl Default for SharedRate {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Everything the audio process thread of one segment needs.
pub(crate) struct AudioJob {
    pub segment: usize,
    /// Asset-time window `[start, end)` this segment contributes.
    pub window: (MediaTime, MediaTime),
    /// Decoded frame queues with their mix weights; the first is the primary track.
    pub inputs: Vec<(Arc<StageQueue<Frame>>, f32)>,
    pub output: Arc<StageQueue<Stamped<AudioFrame>>>,
    pub epoch: u64,
    pub opts: ProcessorOptions,
    pub rate: SharedRate,
    /// Set when upstream stopped early after a failure; the window is not padded.
    pub truncated: Arc<AtomicBool>,
    pub cancel: CancelToken,
}

/// Everything the video process thread of one segment needs.
pub(crate) struct VideoJob {
    pub segment: usize,
    pub window: (MediaTime, MediaTime),
    /// `None` when the segment has no video track; a blank picture is shown instead.
    pub input: Option<Arc<StageQueue<Frame>>>,
    pub output: Arc<StageQueue<Stamped<VideoFrame>>>,
    pub epoch: u64,
    pub opts: ProcessorOptions,
    /// Format of synthesised blank pictures.
    pub blank: VideoDescriptor,
    pub max_errors: u32,
    pub truncated: Arc<AtomicBool>,
    pub cancel: CancelToken,
}

/// Run the audio process loop until every input closes or the segment is cancelled.
///
/// On a natural end the output is padded with silence up to the end of the window;
/// after an upstream failure it stops with the last decoded sample.
pub(crate) fn run_audio(job: AudioJob) -> Result<()> {
    let canon = job.opts.audio_format();
    let sr = canon.sample_rate;
    let channels = canon.channels as usize;
    let (start, end) = job.window;
    let (start_idx, end_idx) = (start.to_samples(sr), end.to_samples(sr));
    let ctx = ErrorContext::segment(job.segment);

    let weights: Vec<f32> = job.inputs.iter().map(|(_, w)| *w).collect();
    let mut mixer = AudioMixer::new(
        channels,
        &weights,
        job.opts.mix_soft_knee,
        job.opts.mix_ceiling,
    );
    mixer.anchor(start_idx);
    let mut formatters: Vec<Option<AudioFormatter>> = job.inputs.iter().map(|_| None).collect();
    let mut sink = AudioSink::new(&job, canon, start_idx);

    tracing::debug!(
        segment = job.segment,
        sources = job.inputs.len(),
        start = %start,
        end = %end,
        "audio process started"
    );

    while let Some(source) = next_source(&mixer, job.inputs.len()) {
        let (queue, _) = &job.inputs[source];
        match queue.pop(&job.cancel) {
            Popped::Item(Frame::Audio(frame)) => {
                let needs_new = formatters[source]
                    .as_ref()
                    .is_none_or(|f| f.source() != frame.descriptor);
                if needs_new {
                    if let Some(mut old) = formatters[source].take() {
                        if let Some(tail) = old.finish().map_err(|e| e.in_context(ctx))? {
                            push_windowed(&mut mixer, source, &tail, start_idx, end_idx);
                        }
                    }
                    tracing::debug!(segment = job.segment, source, format = %frame.descriptor, "audio input format");
                    formatters[source] = Some(
                        AudioFormatter::new(frame.descriptor, canon, job.opts.resample_chunk_frames)
                            .map_err(|e| e.in_context(ctx))?,
                    );
                }
                if let Some(fmt) = formatters[source].as_mut() {
                    if let Some(out) = fmt.push(&frame).map_err(|e| e.in_context(ctx))? {
                        push_windowed(&mut mixer, source, &out, start_idx, end_idx);
                    }
                }
            }
            Popped::Item(Frame::Video(_)) | Popped::TimedOut => continue,
            Popped::Closed => {
                if let Some(fmt) = formatters[source].as_mut() {
                    if let Some(tail) = fmt.finish().map_err(|e| e.in_context(ctx))? {
                        push_windowed(&mut mixer, source, &tail, start_idx, end_idx);
                    }
                }
                mixer.finish(source);
            }
            Popped::Cancelled => return Ok(()),
        }
        while let Some((at, mixed)) = mixer.mix_ready() {
            if !sink.feed(at, &mixed) {
                return Ok(());
            }
        }
    }

    if job.cancel.is_cancelled() {
        return Ok(());
    }
    if job.truncated.load(Ordering::Acquire) {
        tracing::debug!(segment = job.segment, "input ended early; window left unpadded");
        sink.finish();
        return Ok(());
    }
    if sink.feed_silence(end_idx) {
        sink.finish();
    }
    Ok(())
}

/// Source whose buffered data ends earliest; `None` once every source is finished.
fn next_source(mixer: &AudioMixer, count: usize) -> Option<usize> {
    (0..count)
        .filter(|&i| !mixer.is_finished(i))
        .min_by_key(|&i| mixer.buffered_end(i).unwrap_or(i64::MIN))
}

/// Clip a canonical frame to `[lo, hi)` in absolute samples and hand it to the mixer.
fn push_windowed(mixer: &mut AudioMixer, source: usize, frame: &AudioFrame, lo: i64, hi: i64) {
    let Some(samples) = frame.samples.as_f32() else {
        return;
    };
    let channels = frame.descriptor.channels.max(1) as usize;
    let first = frame.pts.to_samples(frame.descriptor.sample_rate);
    let last = first + frame.frames() as i64;
    let (from, to) = (first.max(lo), last.min(hi));
    if to <= from {
        return;
    }
    let a = (from - first) as usize * channels;
    let b = (to - first) as usize * channels;
    mixer.push(source, from, &samples[a..b]);
}

/// Turns mixed content into paced output frames, stretching when the rate is not 1.
struct AudioSink<'a> {
    output: &'a StageQueue<Stamped<AudioFrame>>,
    cancel: &'a CancelToken,
    rate: &'a SharedRate,
    epoch: u64,
    canon: AudioDescriptor,
    channels: usize,
    block: usize,
    stretcher: TimeStretcher,
    stretching: bool,
    /// Content sample index just past everything fed in.
    fed: i64,
    /// Content position of the next output sample; fractional while stretching.
    played: f64,
}

impl<'a> AudioSink<'a> {
    fn new(job: &'a AudioJob, canon: AudioDescriptor, start_idx: i64) -> Self {
        let channels = canon.channels.max(1) as usize;
        Self {
            output: &job.output,
            cancel: &job.cancel,
            rate: &job.rate,
            epoch: job.epoch,
            canon,
            channels,
            block: job.opts.padding_block_frames,
            stretcher: TimeStretcher::new(channels, job.opts.stretch_block_frames, 1.0),
            stretching: false,
            fed: start_idx,
            played: start_idx as f64,
        }
    }

    /// Feed interleaved content starting at absolute sample `at`. Overlap with what was
    /// already fed is dropped and a gap is filled with silence.
    ///
    /// Returns `false` once the output stops accepting frames.
    fn feed(&mut self, at: i64, samples: &[f32]) -> bool {
        let ch = self.channels;
        let mut samples = samples;
        let mut at = at;
        if at < self.fed {
            let skip = ((self.fed - at) as usize).min(samples.len() / ch);
            samples = &samples[skip * ch..];
            at += skip as i64;
        }
        if at > self.fed && !self.feed_silence(at) {
            return false;
        }
        samples
            .chunks(self.block * ch)
            .all(|chunk| self.play(chunk))
    }

    fn feed_silence(&mut self, until: i64) -> bool {
        while self.fed < until {
            let frames = ((until - self.fed) as usize).min(self.block);
            let zeros = vec![0.0f32; frames * self.channels];
            if !self.play(&zeros) {
                return false;
            }
        }
        true
    }

    fn play(&mut self, chunk: &[f32]) -> bool {
        let frames = chunk.len() / self.channels;
        if frames == 0 {
            return true;
        }
        let rate = self.rate.get();
        let fed_before = self.fed;
        self.fed += frames as i64;
        if rate == 1.0 {
            if self.stretching && !self.finish() {
                return false;
            }
            self.played = fed_before as f64;
            return self.emit(chunk.to_vec(), 1.0);
        }
        if !self.stretching {
            self.stretcher.reset();
            self.stretching = true;
            tracing::debug!(rate, "time-stretch engaged");
        }
        self.stretcher.set_rate(rate);
        let out = self.stretcher.process(chunk);
        self.emit(out, self.stretcher.rate())
    }

    /// Flush the stretcher tail, if stretching.
    fn finish(&mut self) -> bool {
        if !self.stretching {
            return true;
        }
        self.stretching = false;
        let rate = self.stretcher.rate();
        let tail = self.stretcher.finish();
        self.emit(tail, rate)
    }

    fn emit(&mut self, samples: Vec<f32>, rate: f64) -> bool {
        let frames = samples.len() / self.channels;
        if frames == 0 {
            return true;
        }
        let pts = MediaTime::from_samples(self.played.round().max(0.0) as u64, self.canon.sample_rate);
        self.played += frames as f64 * rate;
        let mut frame = AudioFrame::new(pts, self.canon, AudioSamples::F32(samples));
        frame.rate = rate;
        self.output
            .push(
                Stamped {
                    epoch: self.epoch,
                    frame,
                },
                self.cancel,
            )
            .is_ok()
    }
}

/// Run the video process loop until the input closes or the segment is cancelled.
pub(crate) fn run_video(job: VideoJob) -> Result<()> {
    let (start, end) = job.window;
    let ctx = ErrorContext::segment(job.segment);
    let push = |frame: VideoFrame| {
        job.output
            .push(
                Stamped {
                    epoch: job.epoch,
                    frame,
                },
                &job.cancel,
            )
            .is_ok()
    };

    let Some(input) = &job.input else {
        tracing::debug!(segment = job.segment, "no video track; showing blank picture");
        push(blank_frame(start, end, job.blank));
        return Ok(());
    };

    let converter = VideoConverter::new(&job.opts);
    let mut emitted = 0u64;
    let mut errors = 0u32;
    loop {
        match input.pop(&job.cancel) {
            Popped::Item(Frame::Video(frame)) => {
                if frame.pts < start || frame.pts >= end {
                    continue;
                }
                match converter.convert(&frame) {
                    Ok(out) => {
                        errors = 0;
                        if !push(out) {
                            return Ok(());
                        }
                        emitted += 1;
                    }
                    Err(e) => {
                        errors += 1;
                        tracing::warn!(segment = job.segment, pts = %frame.pts, "dropping picture: {e}");
                        if errors > job.max_errors {
                            return Err(e.in_context(ctx));
                        }
                    }
                }
            }
            Popped::Item(Frame::Audio(_)) | Popped::TimedOut => continue,
            Popped::Closed => break,
            Popped::Cancelled => return Ok(()),
        }
    }
    if emitted == 0 && !job.cancel.is_cancelled() && !job.truncated.load(Ordering::Acquire) {
        tracing::debug!(segment = job.segment, "video track produced nothing; showing blank picture");
        push(blank_frame(start, end, job.blank));
    }
    Ok(())
}
