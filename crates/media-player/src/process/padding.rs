//! Synthesised output for padding segments and tracks a segment does not carry.

use std::sync::Arc;

use crate::frame::{AudioDescriptor, AudioFrame, PixelFormat, VideoDescriptor, VideoFrame};
use crate::time::MediaTime;

/// Silence covering content `[start, end)` in blocks of at most `block_frames` output frames.
///
/// At `rate` != 1 each block plays for `frames / sample_rate` seconds but covers
/// `rate` times as much content, matching time-stretched program audio.
pub struct Silence {
    descriptor: AudioDescriptor,
    block_frames: usize,
    rate: f64,
    /// Content sample index of the segment start.
    origin: i64,
    total_out: u64,
    done_out: u64,
}

impl Silence {
    pub fn new(
        start: MediaTime,
        end: MediaTime,
        descriptor: AudioDescriptor,
        block_frames: usize,
        rate: f64,
    ) -> Self {
        let sr = descriptor.sample_rate;
        let origin = start.to_samples(sr);
        let content = (end.to_samples(sr) - origin).max(0) as f64;
        let rate = if rate.is_finite() && rate > 0.0 { rate } else { 1.0 };
        Self {
            descriptor,
            block_frames: block_frames.max(1),
            rate,
            origin,
            total_out: (content / rate).round() as u64,
            done_out: 0,
        }
    }
}

impl Iterator for Silence {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<AudioFrame> {
        let remaining = self.total_out - self.done_out;
        if remaining == 0 {
            return None;
        }
        let frames = remaining.min(self.block_frames as u64);
        let offset = (self.done_out as f64 * self.rate).round() as i64;
        let pts = MediaTime::from_samples(
            (self.origin + offset).max(0) as u64,
            self.descriptor.sample_rate,
        );
        self.done_out += frames;
        let mut frame = AudioFrame::silence(pts, frames as usize, self.descriptor);
        frame.rate = self.rate;
        Some(frame)
    }
}

/// Black picture in `descriptor`'s format.
pub fn blank_picture(descriptor: VideoDescriptor) -> Arc<[u8]> {
    let (w, h) = (descriptor.width as usize, descriptor.height as usize);
    let data = match descriptor.pixel_format {
        PixelFormat::Rgba8 | PixelFormat::Bgra8 => [0, 0, 0, 255].repeat(w * h),
        PixelFormat::Rgb24 | PixelFormat::Gray8 => vec![0; descriptor.frame_size()],
        PixelFormat::Yuv420p => {
            let mut data = vec![16; w * h];
            data.resize(descriptor.frame_size(), 128);
            data
        }
    };
    Arc::from(data)
}

/// One blank frame held for the whole of `[start, end)`.
pub fn blank_frame(start: MediaTime, end: MediaTime, descriptor: VideoDescriptor) -> VideoFrame {
    VideoFrame {
        pts: start,
        duration: (end - start).max(MediaTime::ZERO),
        descriptor,
        data: blank_picture(descriptor),
        blank: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SampleFormat;

    fn desc() -> AudioDescriptor {
        AudioDescriptor::new(48_000, 2, SampleFormat::F32)
    }

    #[test]
    fn silence_covers_range_without_gaps() {
        let start = MediaTime::from_secs(5);
        let end = MediaTime::from_secs(7);
        let blocks: Vec<_> = Silence::new(start, end, desc(), 1_024, 1.0).collect();
        assert_eq!(blocks[0].pts, start);
        let total: usize = blocks.iter().map(AudioFrame::frames).sum();
        assert_eq!(total, 96_000);
        for w in blocks.windows(2) {
            assert!((w[1].pts - w[0].end()).abs() <= MediaTime::from_micros(1));
        }
        let last = blocks.last().unwrap();
        assert!((last.end() - end).abs() <= MediaTime::from_micros(1));
    }

    #[test]
    fn stretched_silence_plays_shorter() {
        let blocks: Vec<_> =
            Silence::new(MediaTime::ZERO, MediaTime::from_secs(2), desc(), 4_800, 2.0).collect();
        let played: usize = blocks.iter().map(AudioFrame::frames).sum();
        assert_eq!(played, 48_000);
        assert!(blocks.iter().all(|b| b.rate == 2.0));
        assert_eq!(blocks[1].pts, MediaTime::from_millis(200));
    }

    #[test]
    fn blank_pictures_are_black() {
        let rgba = blank_picture(VideoDescriptor::new(2, 1, PixelFormat::Rgba8));
        assert_eq!(&rgba[..], &[0, 0, 0, 255, 0, 0, 0, 255]);
        let yuv = blank_picture(VideoDescriptor::new(2, 2, PixelFormat::Yuv420p));
        assert_eq!(&yuv[..], &[16, 16, 16, 16, 128, 128]);
        let frame = blank_frame(
            MediaTime::from_secs(5),
            MediaTime::from_secs(7),
            VideoDescriptor::new(2, 2, PixelFormat::Gray8),
        );
        assert!(frame.blank);
        assert_eq!(frame.duration, MediaTime::from_secs(2));
    }
}
