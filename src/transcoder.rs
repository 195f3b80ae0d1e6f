//! Size-capped WebP re-encoding for listing photos.
//!
//! Every photo an admin attaches goes through [`ImageTranscoder::transcode`] before it is
//! staged. The output never exceeds the configured bounds, is never upscaled, and keeps
//! its aspect ratio to within one pixel of rounding.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use thiserror::Error;

use crate::image_file::{ImageFile, WEBP_MIME};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeOptions {
    /// Encoder quality in `0.0..=1.0`.
    pub quality: f32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for TranscodeOptions {
    fn default() -> Self {
        Self {
            quality: 0.85,
            max_width: 1920,
            max_height: 1080,
        }
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("not an image")]
    NotAnImage,
    #[error("image decoding failed: {0}")]
    Decode(String),
    #[error("webp encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Default)]
pub struct ImageTranscoder {
    options: TranscodeOptions,
}

impl ImageTranscoder {
    pub fn new(options: TranscodeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> TranscodeOptions {
        self.options
    }

    /// Converts `file` into a WebP that fits the configured bounds.
    ///
    /// Inputs that are already WebP and already small enough come back unchanged (same
    /// bytes, same name). Decoded pixel buffers live only for the duration of the call.
    pub fn transcode(&self, file: &ImageFile) -> Result<ImageFile, TranscodeError> {
        if !file.declares_image() {
            return Err(TranscodeError::NotAnImage);
        }

        if file.is_webp() {
            if let Ok((width, height)) = probe_dimensions(file) {
                if width <= self.options.max_width && height <= self.options.max_height {
                    return Ok(file.clone());
                }
            }
        }

        let decoded =
            image::load_from_memory(&file.bytes).map_err(|e| TranscodeError::Decode(e.to_string()))?;

        let (width, height) = (decoded.width(), decoded.height());
        let (out_width, out_height) =
            fit_within(width, height, self.options.max_width, self.options.max_height);

        let resized = if (out_width, out_height) == (width, height) {
            decoded
        } else {
            decoded.resize_exact(out_width, out_height, FilterType::Lanczos3)
        };

        let encoded = encode_webp(resized, self.options.quality)?;

        Ok(ImageFile::new(
            format!("{}.webp", file.stem()),
            WEBP_MIME,
            encoded,
        ))
    }
}

fn probe_dimensions(file: &ImageFile) -> Result<(u32, u32), TranscodeError> {
    ImageReader::new(Cursor::new(&file.bytes[..]))
        .with_guessed_format()
        .map_err(|e| TranscodeError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| TranscodeError::Decode(e.to_string()))
}

fn encode_webp(image: DynamicImage, quality: f32) -> Result<Vec<u8>, TranscodeError> {
    // libwebp only takes 8-bit RGB(A)
    let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
    drop(image);

    let encoder =
        webp::Encoder::from_image(&rgba).map_err(|e| TranscodeError::Encode(e.to_string()))?;
    let memory = encoder
        .encode_simple(false, quality.clamp(0.0, 1.0) * 100.0)
        .map_err(|e| TranscodeError::Encode(format!("{e:?}")))?;

    Ok(memory.to_vec())
}

/// Downscale-only fit of `width`×`height` into `max_width`×`max_height`.
///
/// Both sides are rounded to the nearest pixel and never drop below one.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return (width, height);
    }

    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    )
    .min(1.0);

    let scaled = |side: u32, max: u32| -> u32 {
        let value = (f64::from(side) * scale).round() as u32;
        value.clamp(1, max.max(1))
    };

    (scaled(width, max_width), scaled(height, max_height))
}
