//! Logo compositing on an already processed image file.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::media::transform::{encode, OutputFormat};

/// Logo width relative to the image width.
pub const LOGO_WIDTH_RATIO: f32 = 0.18;
pub const PADDING_PX: u32 = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Anchor {
    #[default]
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Center,
}

impl Anchor {
    fn position(self, base: (u32, u32), logo: (u32, u32)) -> (i64, i64) {
        let (bw, bh) = (i64::from(base.0), i64::from(base.1));
        let (lw, lh) = (i64::from(logo.0), i64::from(logo.1));
        let pad = i64::from(PADDING_PX);
        let (x, y) = match self {
            Anchor::TopLeft => (pad, pad),
            Anchor::TopRight => (bw - lw - pad, pad),
            Anchor::BottomLeft => (pad, bh - lh - pad),
            Anchor::BottomRight => (bw - lw - pad, bh - lh - pad),
            Anchor::Center => ((bw - lw) / 2, (bh - lh) / 2),
        };
        (x.max(0), y.max(0))
    }
}

fn media_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::MediaProcessing(format!("watermark: {e}"))
}

/// Composite `logo` onto `base` in memory.
pub fn composite(base: &DynamicImage, logo: &DynamicImage, anchor: Anchor, opacity: f32) -> RgbaImage {
    let mut canvas = base.to_rgba8();
    let (bw, bh) = canvas.dimensions();

    let max_w = bw.saturating_sub(2 * PADDING_PX).max(1);
    let max_h = bh.saturating_sub(2 * PADDING_PX).max(1);
    let target_w = ((bw as f32 * LOGO_WIDTH_RATIO).round() as u32).clamp(1, max_w);
    let mut mark = logo.resize(target_w, max_h, FilterType::Lanczos3).to_rgba8();

    let opacity = opacity.clamp(0.0, 1.0);
    if opacity < 1.0 {
        for px in mark.pixels_mut() {
            px.0[3] = (f32::from(px.0[3]) * opacity).round() as u8;
        }
    }

    let (x, y) = anchor.position((bw, bh), mark.dimensions());
    imageops::overlay(&mut canvas, &mark, x, y);
    canvas
}

/// Watermark the file at `image_path` in place, keeping its format.
pub fn apply_watermark(
    image_path: &Path,
    logo_path: &Path,
    anchor: Anchor,
    opacity: f32,
    quality: u8,
) -> PipelineResult<()> {
    let logo = image::open(logo_path).map_err(media_err)?;
    let base = image::open(image_path).map_err(media_err)?;
    let format = image_path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(OutputFormat::from_ext)
        .unwrap_or(OutputFormat::Jpeg);

    let out = DynamicImage::ImageRgba8(composite(&base, &logo, anchor, opacity));
    let bytes = encode(&out, format, quality)?;
    let tmp = image_path.with_extension(format!("{}.tmp", format.extension()));
    std::fs::write(&tmp, bytes).map_err(media_err)?;
    std::fs::rename(&tmp, image_path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        media_err(e)
    })
}
