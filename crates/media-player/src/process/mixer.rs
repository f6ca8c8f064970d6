//! Sample-accurate mixing of several canonical audio streams.
//!
//! Inputs are placed by absolute sample index, so a source that starts late or has
//! a hole is zero-filled and overlapping data is trimmed. When more than one source
//! is mixed the sum passes through a soft limiter bounded by the ceiling.

use std::collections::VecDeque;

pub struct AudioMixer {
    channels: usize,
    knee: f32,
    ceiling: f32,
    sources: Vec<MixSource>,
    /// Absolute sample frame of the next mixed output.
    cursor: Option<i64>,
}

struct MixSource {
    weight: f32,
    buf: VecDeque<f32>,
    /// Absolute frame index just past the buffered data.
    end: Option<i64>,
    finished: bool,
}

impl AudioMixer {
    /// `weights[0]` is the primary source; its first sample anchors the output.
    pub fn new(channels: usize, weights: &[f32], knee: f32, ceiling: f32) -> Self {
        Self {
            channels: channels.max(1),
            knee,
            ceiling,
            sources: weights
                .iter()
                .map(|&weight| MixSource {
                    weight,
                    buf: VecDeque::new(),
                    end: None,
                    finished: false,
                })
                .collect(),
            cursor: None,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Absolute frame index just past the buffered data of `source`.
    pub fn buffered_end(&self, source: usize) -> Option<i64> {
        self.sources.get(source).and_then(|s| s.end)
    }

    pub fn is_finished(&self, source: usize) -> bool {
        self.sources.get(source).is_none_or(|s| s.finished)
    }

    /// Start output at absolute frame `frame` instead of at the primary's first sample.
    pub fn anchor(&mut self, frame: i64) {
        self.cursor.get_or_insert(frame);
    }

    /// Queue `samples` for `source`, starting at absolute frame `start`.
    pub fn push(&mut self, source: usize, start: i64, samples: &[f32]) {
        let channels = self.channels;
        if source == 0 && self.cursor.is_none() {
            self.cursor = Some(start);
        }
        let floor = self.cursor;
        let Some(src) = self.sources.get_mut(source) else {
            return;
        };
        let frames = (samples.len() / channels) as i64;
        let mut start = start;
        let mut data = &samples[..frames as usize * channels];

        // Trim anything before what is already buffered or mixed.
        let lower = match (src.end, floor) {
            (Some(e), Some(c)) => Some(e.max(c)),
            (Some(e), None) => Some(e),
            (None, c) => c,
        };
        if let Some(lower) = lower {
            if start < lower {
                let skip = ((lower - start).min(frames)) as usize;
                data = &data[skip * channels..];
                start += skip as i64;
            }
            if let Some(end) = src.end {
                if start > end {
                    let gap = (start - end) as usize * channels;
                    src.buf.extend(std::iter::repeat_n(0.0, gap));
                }
            }
        }
        if data.is_empty() {
            return;
        }
        src.buf.extend(data.iter().copied());
        src.end = Some(start + (data.len() / channels) as i64);
    }

    /// No more input will arrive for `source`.
    pub fn finish(&mut self, source: usize) {
        if let Some(s) = self.sources.get_mut(source) {
            s.finished = true;
        }
    }

    /// Mix everything every live source has covered. Returns `(start_frame, interleaved)`.
    pub fn mix_ready(&mut self) -> Option<(i64, Vec<f32>)> {
        let cursor = self.cursor?;
        let all_finished = self.sources.iter().all(|s| s.finished);
        let mut ready_end = if all_finished { i64::MIN } else { i64::MAX };
        for s in &self.sources {
            let end = s.end.unwrap_or(cursor);
            if all_finished {
                ready_end = ready_end.max(end);
            } else if !s.finished {
                ready_end = ready_end.min(end);
            }
        }
        if ready_end <= cursor {
            return None;
        }
        let frames = (ready_end - cursor) as usize;
        let channels = self.channels;
        let mut out = vec![0.0f32; frames * channels];
        for s in &mut self.sources {
            let Some(end) = s.end else {
                continue;
            };
            let buf_start = end - (s.buf.len() / channels) as i64;
            // Drop buffered data that precedes the cursor.
            if buf_start < cursor {
                let skip = ((cursor - buf_start) as usize * channels).min(s.buf.len());
                s.buf.drain(..skip);
            }
            let buf_start = end - (s.buf.len() / channels) as i64;
            let offset = (buf_start - cursor).max(0) as usize;
            if offset >= frames {
                continue;
            }
            let take = (frames - offset).min(s.buf.len() / channels) * channels;
            for (i, v) in s.buf.drain(..take).enumerate() {
                out[offset * channels + i] += s.weight * v;
            }
        }
        if self.sources.len() > 1 {
            for v in &mut out {
                *v = soft_limit(*v, self.knee, self.ceiling);
            }
        }
        self.cursor = Some(ready_end);
        Some((cursor, out))
    }

    /// Everything pushed has been mixed and every source is finished.
    pub fn is_drained(&self) -> bool {
        let cursor = self.cursor.unwrap_or(i64::MIN);
        self.sources
            .iter()
            .all(|s| s.finished && s.end.is_none_or(|e| e <= cursor))
    }

    pub fn reset(&mut self) {
        for s in &mut self.sources {
            s.buf.clear();
            s.end = None;
            s.finished = false;
        }
        self.cursor = None;
    }
}

/// Linear below `knee`, then a tanh curve that saturates at `ceiling`.
pub fn soft_limit(x: f32, knee: f32, ceiling: f32) -> f32 {
    let mag = x.abs();
    if mag <= knee {
        return x;
    }
    let span = ceiling - knee;
    let shaped = knee + span * ((mag - knee) / span).tanh();
    shaped.min(ceiling).copysign(x)
}
