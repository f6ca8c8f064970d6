//! Pixel-format conversion and scaling of decoded pictures.
//!
//! Every conversion goes through an `image::RgbaImage`: unpack the source layout,
//! resize with the configured filter, then pack into the renderer format.
//! Pictures that already match the target are passed through without copying.

use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage, Rgba, RgbaImage};

use crate::config::{ProcessorOptions, ScaleFilter};
use crate::error::{PlayerError, Result};
use crate::frame::{PixelFormat, VideoDescriptor, VideoFrame};

pub struct VideoConverter {
    width: Option<u32>,
    height: Option<u32>,
    format: PixelFormat,
    filter: ScaleFilter,
}

impl VideoConverter {
    pub fn new(opts: &ProcessorOptions) -> Self {
        Self {
            width: opts.width,
            height: opts.height,
            format: opts.pixel_format,
            filter: opts.scale_filter,
        }
    }

    /// Output format for pictures described by `src`.
    ///
    /// A single configured dimension keeps the source aspect ratio.
    pub fn target(&self, src: &VideoDescriptor) -> VideoDescriptor {
        let (sw, sh) = (src.width.max(1) as u64, src.height.max(1) as u64);
        let (width, height) = match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => (w, ((w as u64 * sh + sw / 2) / sw).max(1) as u32),
            (None, Some(h)) => (((h as u64 * sw + sh / 2) / sh).max(1) as u32, h),
            (None, None) => (src.width, src.height),
        };
        VideoDescriptor {
            width,
            height,
            pixel_format: self.format,
            frame_rate: src.frame_rate,
        }
    }

    pub fn convert(&self, frame: &VideoFrame) -> Result<VideoFrame> {
        let src = frame.descriptor;
        let dst = self.target(&src);
        if dst.width == src.width && dst.height == src.height && dst.pixel_format == src.pixel_format {
            return Ok(frame.clone());
        }
        if !dst.pixel_format.is_packed() {
            return Err(PlayerError::process(format!(
                "cannot convert {src} to planar {:?}",
                dst.pixel_format
            )));
        }
        if frame.data.len() < src.frame_size() {
            return Err(PlayerError::process(format!(
                "picture holds {} bytes, {src} needs {}",
                frame.data.len(),
                src.frame_size()
            )));
        }
        let rgba = to_rgba(&src, &frame.data)?;
        let scaled = if (dst.width, dst.height) == (src.width, src.height) {
            rgba
        } else {
            imageops::resize(&rgba, dst.width, dst.height, filter_type(self.filter))
        };
        Ok(VideoFrame {
            pts: frame.pts,
            duration: frame.duration,
            descriptor: dst,
            data: Arc::from(from_rgba(scaled, dst.pixel_format)),
            blank: frame.blank,
        })
    }
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 limited-range YUV to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 1.164 * (y as f32 - 16.0);
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    [
        clamp_u8(c + 1.596 * e),
        clamp_u8(c - 0.392 * d - 0.813 * e),
        clamp_u8(c + 2.017 * d),
    ]
}

fn filter_type(filter: ScaleFilter) -> FilterType {
    match filter {
        ScaleFilter::Nearest => FilterType::Nearest,
        ScaleFilter::Bilinear => FilterType::Triangle,
        ScaleFilter::Bicubic => FilterType::CatmullRom,
    }
}

fn swap_red_blue(px: &mut [u8]) {
    for p in px.chunks_exact_mut(4) {
        p.swap(0, 2);
    }
}

fn to_rgba(desc: &VideoDescriptor, data: &[u8]) -> Result<RgbaImage> {
    let (w, h) = (desc.width, desc.height);
    let (wu, hu) = (w as usize, h as usize);
    let image = match desc.pixel_format {
        PixelFormat::Rgba8 => RgbaImage::from_raw(w, h, data[..wu * hu * 4].to_vec()),
        PixelFormat::Bgra8 => {
            let mut px = data[..wu * hu * 4].to_vec();
            swap_red_blue(&mut px);
            RgbaImage::from_raw(w, h, px)
        }
        PixelFormat::Rgb24 => {
            RgbImage::from_raw(w, h, data[..wu * hu * 3].to_vec()).map(|i| DynamicImage::ImageRgb8(i).into_rgba8())
        }
        PixelFormat::Gray8 => {
            GrayImage::from_raw(w, h, data[..wu * hu].to_vec()).map(|i| DynamicImage::ImageLuma8(i).into_rgba8())
        }
        PixelFormat::Yuv420p => {
            let cw = wu.div_ceil(2);
            let ch = hu.div_ceil(2);
            let (luma, chroma) = data.split_at(wu * hu);
            let (u_plane, v_plane) = chroma.split_at(cw * ch);
            Some(RgbaImage::from_fn(w, h, |x, y| {
                let (x, y) = (x as usize, y as usize);
                let ci = (y / 2) * cw + x / 2;
                let [r, g, b] = yuv_to_rgb(luma[y * wu + x], u_plane[ci], v_plane[ci]);
                Rgba([r, g, b, 255])
            }))
        }
    };
    image.ok_or_else(|| PlayerError::process(format!("picture buffer does not fit {desc}")))
}

fn from_rgba(image: RgbaImage, format: PixelFormat) -> Vec<u8> {
    match format {
        PixelFormat::Rgba8 => image.into_raw(),
        PixelFormat::Bgra8 => {
            let mut px = image.into_raw();
            swap_red_blue(&mut px);
            px
        }
        PixelFormat::Rgb24 => DynamicImage::ImageRgba8(image).into_rgb8().into_raw(),
        PixelFormat::Gray8 => DynamicImage::ImageRgba8(image).into_luma8().into_raw(),
        // Rejected by `convert` before we get here.
        PixelFormat::Yuv420p => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MediaTime;

    fn frame(desc: VideoDescriptor, data: Vec<u8>) -> VideoFrame {
        VideoFrame {
            pts: MediaTime::from_millis(40),
            duration: MediaTime::from_millis(40),
            descriptor: desc,
            data: Arc::from(data),
            blank: false,
        }
    }

    fn converter(width: Option<u32>, height: Option<u32>, format: PixelFormat, filter: ScaleFilter) -> VideoConverter {
        VideoConverter {
            width,
            height,
            format,
            filter,
        }
    }

    #[test]
    fn limited_range_yuv_maps_to_full_range_rgb() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
        let [r, g, b] = yuv_to_rgb(81, 90, 240);
        assert!(r > 200 && g < 40 && b < 40, "{r} {g} {b}");
    }

    #[test]
    fn yuv_picture_converts_to_rgba() {
        let desc = VideoDescriptor::new(2, 2, PixelFormat::Yuv420p);
        let src = frame(desc, vec![235, 235, 235, 235, 128, 128]);
        let out = converter(None, None, PixelFormat::Rgba8, ScaleFilter::Bilinear)
            .convert(&src)
            .unwrap();
        assert_eq!(out.descriptor.pixel_format, PixelFormat::Rgba8);
        assert_eq!(&out.data[..], &[255u8; 16][..]);
        assert_eq!(out.pts, src.pts);
    }

    #[test]
    fn matching_format_is_passed_through() {
        let desc = VideoDescriptor::new(2, 1, PixelFormat::Rgba8);
        let src = frame(desc, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let out = converter(None, None, PixelFormat::Rgba8, ScaleFilter::Nearest)
            .convert(&src)
            .unwrap();
        assert!(Arc::ptr_eq(&out.data, &src.data));
    }

    #[test]
    fn nearest_upscale_replicates_pixels() {
        let desc = VideoDescriptor::new(2, 1, PixelFormat::Gray8);
        let src = frame(desc, vec![10, 200]);
        let out = converter(Some(4), Some(1), PixelFormat::Gray8, ScaleFilter::Nearest)
            .convert(&src)
            .unwrap();
        assert_eq!(out.data.len(), 4);
        assert_eq!((out.data[0], out.data[3]), (10, 200));
    }

    #[test]
    fn smooth_filters_keep_flat_images_flat() {
        let desc = VideoDescriptor::new(3, 3, PixelFormat::Rgb24);
        let src = frame(desc, [40u8, 80, 120].repeat(9));
        for filter in [ScaleFilter::Bilinear, ScaleFilter::Bicubic] {
            let out = converter(Some(7), Some(5), PixelFormat::Rgb24, filter)
                .convert(&src)
                .unwrap();
            assert_eq!(out.data.len(), 7 * 5 * 3);
            assert!(out.data.chunks_exact(3).all(|px| px == [40, 80, 120]), "{filter:?}");
        }
    }

    #[test]
    fn bilinear_downscale_averages_neighbours() {
        let desc = VideoDescriptor::new(2, 1, PixelFormat::Gray8);
        let src = frame(desc, vec![0, 200]);
        let out = converter(Some(1), Some(1), PixelFormat::Gray8, ScaleFilter::Bilinear)
            .convert(&src)
            .unwrap();
        assert_eq!(&out.data[..], &[100]);
    }

    #[test]
    fn bgra_is_unpacked_before_resizing() {
        let desc = VideoDescriptor::new(1, 1, PixelFormat::Bgra8);
        let src = frame(desc, vec![1, 2, 3, 255]);
        let out = converter(Some(2), Some(2), PixelFormat::Rgba8, ScaleFilter::Bicubic)
            .convert(&src)
            .unwrap();
        assert!(out.data.chunks_exact(4).all(|px| px == [3, 2, 1, 255]));
    }

    #[test]
    fn short_picture_buffer_is_a_process_error() {
        let desc = VideoDescriptor::new(4, 4, PixelFormat::Rgb24);
        let src = frame(desc, vec![0; 10]);
        let err = converter(Some(2), Some(2), PixelFormat::Rgba8, ScaleFilter::Nearest)
            .convert(&src)
            .unwrap_err();
        assert!(matches!(err, PlayerError::Process { .. }));
    }

    #[test]
    fn single_dimension_keeps_aspect_ratio() {
        let conv = converter(Some(320), None, PixelFormat::Rgba8, ScaleFilter::Bilinear);
        let dst = conv.target(&VideoDescriptor::new(1920, 1080, PixelFormat::Yuv420p));
        assert_eq!((dst.width, dst.height), (320, 180));
    }

    #[test]
    fn planar_target_is_a_process_error() {
        let desc = VideoDescriptor::new(2, 2, PixelFormat::Rgba8);
        let src = frame(desc, vec![0; 16]);
        let err = converter(None, None, PixelFormat::Yuv420p, ScaleFilter::Bilinear)
            .convert(&src)
            .unwrap_err();
        assert!(matches!(err, PlayerError::Process { .. }));
    }
}
