//! Streaming sample-rate conversion.
//!
//! Wraps Rubato's sinc resampler behind a push interface: callers hand in interleaved
//! `f32` of any length and get back whatever output is ready. The resampler's
//! inherent delay is trimmed from the front and `finish()` flushes the tail so the
//! total output length matches `input * dst / src`.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{PlayerError, Result};

pub struct StreamResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    ratio: f64,
    pending: Vec<f32>,
    out_interleaved: Vec<f32>,
    indexing: Indexing,
    /// Leading output frames still to discard.
    skip_frames: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    /// Build a resampler from `src_rate` to `dst_rate` for `channels` interleaved channels.
    ///
    /// `chunk_frames` is the fixed input block (higher => more latency, lower => more overhead).
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(PlayerError::process(format!(
                "cannot resample {src_rate} Hz -> {dst_rate} Hz with {channels} channels"
            )));
        }
        let ratio = dst_rate as f64 / src_rate as f64;

        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler = Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| PlayerError::process(format!("resampler init: {e}")))?;
        let skip_frames = resampler.output_delay();

        let out_chunks = (ratio * 1.1).ceil().max(3.0) as usize;
        Ok(Self {
            resampler: Box::new(resampler),
            channels,
            chunk_frames,
            ratio,
            pending: Vec::with_capacity(chunk_frames * channels * 2),
            out_interleaved: vec![0.0f32; channels * chunk_frames * out_chunks],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
            skip_frames,
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Feed interleaved input; returns output produced by every complete chunk.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.frames_in += (input.len() / self.channels) as u64;
        self.pending.extend_from_slice(input);
        let chunk_samples = self.chunk_frames * self.channels;
        let mut out = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_samples {
            let chunk: Vec<f32> = self.pending[consumed..consumed + chunk_samples].to_vec();
            self.run_chunk(&chunk, None, &mut out)?;
            consumed += chunk_samples;
        }
        self.pending.drain(..consumed);
        Ok(out)
    }

    /// Flush buffered input and the resampler's delay line.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let expected = (self.frames_in as f64 * self.ratio).round() as u64;
        let mut out = Vec::new();
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames > 0 {
            let mut tail = std::mem::take(&mut self.pending);
            tail.resize(self.chunk_frames * self.channels, 0.0);
            self.run_chunk(&tail, Some(tail_frames), &mut out)?;
        }
        // Push silence through until the delayed tail has come out.
        let silence = vec![0.0f32; self.chunk_frames * self.channels];
        let mut guard = 0;
        while self.frames_out < expected && guard < 16 {
            self.run_chunk(&silence, Some(0), &mut out)?;
            guard += 1;
        }
        let excess = self.frames_out.saturating_sub(expected) as usize;
        let keep = out.len().saturating_sub(excess * self.channels);
        out.truncate(keep);
        self.frames_out = self.frames_out.min(expected);
        Ok(out)
    }

    fn run_chunk(&mut self, chunk: &[f32], partial: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let channels = self.channels;
        let input_adapter = InterleavedSlice::new(chunk, channels, self.chunk_frames)
            .map_err(|e| PlayerError::process(format!("interleaved slice (input): {e}")))?;
        let out_capacity_frames = self.out_interleaved.len() / channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_interleaved, channels, out_capacity_frames)
                .map_err(|e| PlayerError::process(format!("interleaved slice (output): {e}")))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial;

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| PlayerError::process(format!("resampler process: {e}")))?;

        let skip = self.skip_frames.min(nbr_out);
        self.skip_frames -= skip;
        let produced = &self.out_interleaved[skip * channels..nbr_out * channels];
        self.frames_out += (nbr_out - skip) as u64;
        out.extend_from_slice(produced);
        Ok(())
    }

    /// Drop buffered input and start over (after a seek).
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.skip_frames = self.resampler.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
    }
}
