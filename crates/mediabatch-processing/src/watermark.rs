//! PNG watermark overlay for generated thumbnails.

use anyhow::Result;
use image::{imageops, DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone)]
pub struct WatermarkConfig {
    pub position: WatermarkPosition,
    /// Alpha multiplier applied to the overlay, 0.0 to 1.0.
    pub opacity: f32,
    /// Inset from the anchored edges in pixels.
    pub margin_px: u32,
    /// Overlay width as a fraction of the image width; aspect is preserved.
    pub width_fraction: f32,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            position: WatermarkPosition::BottomRight,
            opacity: 0.8,
            margin_px: 10,
            width_fraction: 0.25,
        }
    }
}

pub struct Watermark;

impl Watermark {
    /// Overlay a watermark image onto `img` according to `config`.
    pub fn apply(
        img: DynamicImage,
        watermark_data: &[u8],
        config: &WatermarkConfig,
    ) -> Result<DynamicImage> {
        let cursor = Cursor::new(watermark_data);
        let reader = ImageReader::new(cursor).with_guessed_format()?;
        let mut watermark_img = reader.decode()?.to_rgba8();

        let (img_width, img_height) = img.dimensions();
        let (wm_width, wm_height) = watermark_img.dimensions();

        let target_w =
            ((img_width as f32 * config.width_fraction).round() as u32).clamp(1, img_width);
        let target_h = ((target_w as f32 * wm_height as f32 / wm_width as f32).round() as u32)
            .clamp(1, img_height);

        if wm_width != target_w || wm_height != target_h {
            let resized = DynamicImage::ImageRgba8(watermark_img).resize_exact(
                target_w,
                target_h,
                imageops::FilterType::Lanczos3,
            );
            watermark_img = resized.to_rgba8();
        }

        if config.opacity < 1.0 {
            for pixel in watermark_img.pixels_mut() {
                pixel[3] = (pixel[3] as f32 * config.opacity) as u8;
            }
        }

        let margin = config.margin_px as i64;
        let (x, y) = match config.position {
            WatermarkPosition::TopLeft => (margin, margin),
            WatermarkPosition::TopRight => {
                ((img_width as i64 - target_w as i64 - margin).max(0), margin)
            }
            WatermarkPosition::BottomLeft => {
                (margin, (img_height as i64 - target_h as i64 - margin).max(0))
            }
            WatermarkPosition::BottomRight => (
                (img_width as i64 - target_w as i64 - margin).max(0),
                (img_height as i64 - target_h as i64 - margin).max(0),
            ),
        };

        let mut img_rgba = img.to_rgba8();
        imageops::overlay(&mut img_rgba, &watermark_img, x, y);

        Ok(DynamicImage::ImageRgba8(img_rgba))
    }
}
