//! Resize + re-encode. CPU-bound; callers run it on the blocking pool.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Gif,
}

impl OutputFormat {
    /// From the URL's path extension, then the response content type; JPEG otherwise.
    pub fn detect(url: &str, content_type: Option<&str>) -> Self {
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .to_ascii_lowercase();
        let by_ext = path.rsplit_once('.').and_then(|(_, ext)| Self::from_ext(ext));
        by_ext
            .or_else(|| {
                content_type
                    .and_then(|ct| ct.strip_prefix("image/"))
                    .and_then(Self::from_ext)
            })
            .unwrap_or(OutputFormat::Jpeg)
    }

    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }
}

fn media_err(e: image::ImageError) -> PipelineError {
    PipelineError::MediaProcessing(e.to_string())
}

/// Fit inside the bounds, never enlarging. `None` bounds are unconstrained.
pub fn fit_within(img: DynamicImage, max_w: Option<u32>, max_h: Option<u32>) -> DynamicImage {
    let bw = max_w.unwrap_or(u32::MAX);
    let bh = max_h.unwrap_or(u32::MAX);
    if img.width() <= bw && img.height() <= bh {
        return img;
    }
    img.resize(bw.min(img.width()), bh.min(img.height()), FilterType::Lanczos3)
}

/// Encode `img` in `format`. Quality applies to JPEG; the other encoders
/// bundled with `image` are lossless.
pub fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> PipelineResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
            rgb.write_with_encoder(encoder).map_err(media_err)?;
        }
        OutputFormat::Png => img.write_to(&mut buf, ImageFormat::Png).map_err(media_err)?,
        OutputFormat::Webp => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_to(&mut buf, ImageFormat::WebP)
            .map_err(media_err)?,
        OutputFormat::Gif => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_to(&mut buf, ImageFormat::Gif)
            .map_err(media_err)?,
    }
    Ok(buf.into_inner())
}

/// Decode, fit, re-encode.
pub fn resize_and_encode(
    bytes: &[u8],
    format: OutputFormat,
    max_w: Option<u32>,
    max_h: Option<u32>,
    quality: u8,
) -> PipelineResult<Vec<u8>> {
    let img = image::load_from_memory(bytes).map_err(media_err)?;
    let img = fit_within(img, max_w, max_h);
    encode(&img, format, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn never_enlarges() {
        let small = DynamicImage::ImageRgb8(RgbImage::new(100, 50));
        let out = fit_within(small, Some(800), Some(800));
        assert_eq!((out.width(), out.height()), (100, 50));
    }

    #[test]
    fn shrinks_keeping_aspect() {
        let big = DynamicImage::ImageRgb8(RgbImage::new(2000, 1000));
        let out = fit_within(big, Some(800), None);
        assert_eq!((out.width(), out.height()), (800, 400));
    }

    #[test]
    fn detects_format_from_extension_then_content_type() {
        assert_eq!(OutputFormat::detect("https://c.test/a.PNG?x=1", None), OutputFormat::Png);
        assert_eq!(
            OutputFormat::detect("https://c.test/image", Some("image/webp")),
            OutputFormat::Webp
        );
        assert_eq!(OutputFormat::detect("https://c.test/image", None), OutputFormat::Jpeg);
    }
}
