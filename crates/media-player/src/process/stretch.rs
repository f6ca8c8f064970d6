//! Pitch-preserving time-stretch (WSOLA).
//!
//! Waveform-similarity overlap-add over fixed blocks of `N` frames: every synthesis
//! hop emits `N/2` output frames while the analysis position advances by
//! `N/2 * rate` input frames. Each analysis block is shifted by up to `N/4` frames
//! to best line up with the natural continuation of the previous block, which keeps
//! the waveform phase-coherent and the pitch unchanged.

use std::f32::consts::TAU;

pub struct TimeStretcher {
    channels: usize,
    block: usize,
    hop: usize,
    tolerance: usize,
    window: Vec<f32>,
    rate: f64,
    /// Interleaved input; `input[0]` is absolute frame `input_start`.
    input: Vec<f32>,
    /// Channel sum of `input`, one value per frame.
    mono: Vec<f32>,
    input_start: u64,
    /// Next analysis position (absolute input frame, fractional).
    analysis: f64,
    /// Start of the previously chosen block, if any.
    previous: Option<u64>,
    /// Overlap-add accumulator, `block` frames.
    acc: Vec<f32>,
    frames_out: u64,
    /// Output owed for the input pushed so far, summed per rate.
    expected_out: f64,
}

impl TimeStretcher {
    /// `block_frames` is rounded up to an even number of at least 64.
    pub fn new(channels: usize, block_frames: usize, rate: f64) -> Self {
        let block = block_frames.max(64).next_multiple_of(2);
        // Periodic Hann: overlapping halves sum to exactly one.
        let window = (0..block)
            .map(|i| 0.5 - 0.5 * (TAU * i as f32 / block as f32).cos())
            .collect();
        let channels = channels.max(1);
        Self {
            channels,
            block,
            hop: block / 2,
            tolerance: block / 4,
            window,
            rate: sanitize(rate),
            input: Vec::new(),
            mono: Vec::new(),
            input_start: 0,
            analysis: 0.0,
            previous: None,
            acc: vec![0.0; block * channels],
            frames_out: 0,
            expected_out: 0.0,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Takes effect from the next synthesis hop. Input already buffered but not yet
    /// consumed is owed at the new rate.
    pub fn set_rate(&mut self, rate: f64) {
        let rate = sanitize(rate);
        if rate == self.rate {
            return;
        }
        let pending = (self.input_end() as f64 - self.analysis).max(0.0);
        self.expected_out += pending / rate - pending / self.rate;
        self.rate = rate;
    }

    pub fn block_frames(&self) -> usize {
        self.block
    }

    /// Input frames consumed by emitted output so far (fractional).
    pub fn consumed(&self) -> f64 {
        self.analysis
    }

    /// Feed interleaved input, returning whatever output hops are complete.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let frames = input.len() / self.channels;
        self.expected_out += frames as f64 / self.rate;
        self.append(&input[..frames * self.channels]);
        let mut out = Vec::new();
        while self.can_step() {
            self.step(&mut out);
        }
        out
    }

    /// Drain everything, padding with silence, so that the total output equals the
    /// rate-weighted input length.
    pub fn finish(&mut self) -> Vec<f32> {
        let target = self.expected_out.round() as u64;
        let mut out = Vec::new();
        while self.frames_out < target {
            let needed_end = self.needed_end();
            let have_end = self.input_end();
            if needed_end > have_end {
                let pad = (needed_end - have_end) as usize;
                self.input.extend(std::iter::repeat_n(0.0, pad * self.channels));
                self.mono.extend(std::iter::repeat_n(0.0, pad));
            }
            self.step(&mut out);
        }
        let excess = (self.frames_out - target) as usize;
        out.truncate(out.len().saturating_sub(excess * self.channels));
        self.frames_out = target;
        self.reset();
        out
    }

    /// Forget buffered input and overlap; the rate is kept.
    pub fn reset(&mut self) {
        self.input.clear();
        self.mono.clear();
        self.input_start = 0;
        self.analysis = 0.0;
        self.previous = None;
        self.acc.fill(0.0);
        self.frames_out = 0;
        self.expected_out = 0.0;
    }

    /// Last input frame (exclusive) a step at the current position reads.
    fn needed_end(&self) -> u64 {
        let target = self.analysis.round() as u64;
        let search_end = target + self.tolerance as u64 + self.block as u64;
        match self.previous {
            Some(p) => search_end.max(p + self.hop as u64 + self.block as u64),
            None => target + self.block as u64,
        }
    }

    /// Absolute frame just past the buffered input.
    fn input_end(&self) -> u64 {
        self.input_start + (self.input.len() / self.channels) as u64
    }

    fn can_step(&self) -> bool {
        self.needed_end() <= self.input_end()
    }

    fn frame_offset(&self, abs: u64) -> usize {
        (abs - self.input_start) as usize * self.channels
    }

    fn append(&mut self, interleaved: &[f32]) {
        self.input.extend_from_slice(interleaved);
        self.mono.extend(
            interleaved
                .chunks_exact(self.channels)
                .map(|f| f.iter().sum::<f32>()),
        );
    }

    fn choose_block(&self) -> u64 {
        let target = self.analysis.round() as u64;
        let Some(prev) = self.previous else {
            return target;
        };
        let natural = (prev + self.hop as u64 - self.input_start) as usize;
        let reference = &self.mono[natural..natural + self.hop];
        let lo = target.saturating_sub(self.tolerance as u64).max(self.input_start);
        let hi = target + self.tolerance as u64;
        let mut best = lo;
        let mut best_score = f32::NEG_INFINITY;
        for cand in lo..=hi {
            let start = (cand - self.input_start) as usize;
            let score: f32 = self.mono[start..start + self.hop]
                .iter()
                .zip(reference)
                .step_by(2)
                .map(|(a, b)| a * b)
                .sum();
            if score > best_score {
                best_score = score;
                best = cand;
            }
        }
        best
    }

    fn step(&mut self, out: &mut Vec<f32>) {
        let chosen = self.choose_block();
        let first = self.previous.is_none();
        let base = self.frame_offset(chosen);
        for i in 0..self.block {
            // The very first block is not faded in.
            let w = if first && i < self.hop {
                1.0
            } else {
                self.window[i]
            };
            for ch in 0..self.channels {
                self.acc[i * self.channels + ch] += w * self.input[base + i * self.channels + ch];
            }
        }

        let hop_samples = self.hop * self.channels;
        out.extend_from_slice(&self.acc[..hop_samples]);
        self.acc.copy_within(hop_samples.., 0);
        let len = self.acc.len();
        self.acc[len - hop_samples..].fill(0.0);
        self.frames_out += self.hop as u64;

        self.previous = Some(chosen);
        self.analysis += self.hop as f64 * self.rate;
        self.discard_consumed();
    }

    fn discard_consumed(&mut self) {
        let target = self.analysis.round() as u64;
        let mut keep_from = target.saturating_sub(self.tolerance as u64);
        if let Some(p) = self.previous {
            keep_from = keep_from.min(p + self.hop as u64);
        }
        if keep_from > self.input_start {
            let drop_frames = (keep_from - self.input_start) as usize;
            let drop_frames = drop_frames.min(self.mono.len());
            self.input.drain(..drop_frames * self.channels);
            self.mono.drain(..drop_frames);
            self.input_start += drop_frames as u64;
        }
    }
}

fn sanitize(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate.clamp(0.25, 4.0)
    } else {
        1.0
    }
}
