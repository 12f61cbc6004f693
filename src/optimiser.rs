//! Image re-encoding
//!
//! Everything is re-encoded as WebP. Two entry points:
//!
//! - [`Optimiser::optimise`]: one encode, either at an explicit quality, at a
//!   fixed lossy quality for photographic sources, or lossless for
//!   everything else.
//! - [`Optimiser::optimise_to_target`]: searches quality and dimensions until
//!   the output fits a byte budget (see [`crate::search`]).
//!
//! Alpha is never flattened.

use image::{imageops::FilterType, DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::AppError;
use crate::search::{Dimensions, SearchOutcome, SizeSearch};

/// Budget for images handed to AI inference
pub const ALT_TARGET_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_LOSSY_QUALITY: u8 = 80;
/// Largest width or height libwebp will encode
pub const MAX_WEBP_EDGE: u32 = 16383;

#[derive(Debug, Error)]
pub enum OptimiseError {
    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("quality must be between 1 and 100, got {0}")]
    InvalidQuality(u8),

    #[error("image is {width}x{height}, WebP allows at most 16383 pixels per edge")]
    TooLarge { width: u32, height: u32 },

    #[error("cannot fit image into {target} bytes (smallest frame {width}x{height})")]
    TargetUnreachable {
        target: usize,
        width: u32,
        height: u32,
    },

    #[error("encode failed: {0}")]
    Encode(String),
}

impl From<OptimiseError> for AppError {
    fn from(e: OptimiseError) -> Self {
        match e {
            OptimiseError::UnsupportedFormat
            | OptimiseError::InvalidQuality(_)
            | OptimiseError::TooLarge { .. } => {
                AppError::Validation(e.to_string())
            }
            OptimiseError::TargetUnreachable { .. } => {
                tracing::info!("{}", e);
                AppError::TargetUnreachable
            }
            OptimiseError::Encode(_) => AppError::Internal(anyhow::anyhow!(e)),
        }
    }
}

/// Encoder seam; the production implementation is [`WebpEncoder`]
pub trait ImageEncoder: Send + Sync {
    fn encode_lossy(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, OptimiseError>;

    fn encode_lossless(&self, image: &DynamicImage) -> Result<Vec<u8>, OptimiseError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebpEncoder;

impl ImageEncoder for WebpEncoder {
    fn encode_lossy(&self, image: &DynamicImage, quality: u8) -> Result<Vec<u8>, OptimiseError> {
        let encoder = webp::Encoder::from_image(image)
            .map_err(|e| OptimiseError::Encode(e.to_string()))?;
        let memory = encoder
            .encode_simple(false, f32::from(quality))
            .map_err(|e| OptimiseError::Encode(format!("{:?}", e)))?;
        Ok(memory.to_vec())
    }

    fn encode_lossless(&self, image: &DynamicImage) -> Result<Vec<u8>, OptimiseError> {
        let encoder = webp::Encoder::from_image(image)
            .map_err(|e| OptimiseError::Encode(e.to_string()))?;
        // libwebp ignores quality for lossless; 75 is its default effort
        let memory = encoder
            .encode_simple(true, 75.0)
            .map_err(|e| OptimiseError::Encode(format!("{:?}", e)))?;
        Ok(memory.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OptimiseOptions {
    pub quality: Option<u8>,
    pub lossy: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimisedImage {
    #[serde(skip)]
    pub buffer: Vec<u8>,
    pub compression_ratio: f64,
    pub width: u32,
    pub height: u32,
    pub quality: Option<u8>,
    pub lossy: bool,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl OptimisedImage {
    fn new(input_len: usize, buffer: Vec<u8>, dims: Dimensions, quality: Option<u8>) -> Self {
        let compression_ratio = input_len as f64 / buffer.len().max(1) as f64;
        Self {
            size: buffer.len(),
            buffer,
            compression_ratio,
            width: dims.width,
            height: dims.height,
            quality,
            lossy: quality.is_some(),
            url: None,
        }
    }
}

/// `{unix_time}-{content_hash}.webp`, the hash being the first 16 hex chars of SHA-256
pub fn content_filename(bytes: &[u8], unix_time: i64) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!("{}-{}.webp", unix_time, &digest[..16])
}

struct Decoded {
    image: DynamicImage,
    format: ImageFormat,
}

fn decode(input: &[u8]) -> Result<Decoded, OptimiseError> {
    let format = image::guess_format(input).map_err(|_| OptimiseError::UnsupportedFormat)?;
    let image = image::load_from_memory_with_format(input, format)
        .map_err(|_| OptimiseError::UnsupportedFormat)?;

    // The WebP encoder takes 8-bit RGB or RGBA only.
    let image = if image.color().has_alpha() {
        DynamicImage::ImageRgba8(image.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    Ok(Decoded { image, format })
}

#[derive(Debug, Clone, Default)]
pub struct Optimiser<E = WebpEncoder> {
    encoder: E,
}

impl Optimiser<WebpEncoder> {
    pub fn webp() -> Self {
        Self {
            encoder: WebpEncoder,
        }
    }
}

impl<E: ImageEncoder> Optimiser<E> {
    pub fn new(encoder: E) -> Self {
        Self { encoder }
    }

    pub fn optimise(
        &self,
        input: &[u8],
        options: OptimiseOptions,
    ) -> Result<OptimisedImage, OptimiseError> {
        if let Some(q) = options.quality {
            if !(1..=100).contains(&q) {
                return Err(OptimiseError::InvalidQuality(q));
            }
        }

        let Decoded { image, format } = decode(input)?;
        let dims = Dimensions::new(image.width(), image.height());
        if dims.long_edge() > MAX_WEBP_EDGE {
            return Err(OptimiseError::TooLarge {
                width: dims.width,
                height: dims.height,
            });
        }

        let quality = match (options.quality, options.lossy) {
            (Some(q), _) => Some(q),
            (None, Some(true)) => Some(DEFAULT_LOSSY_QUALITY),
            (None, Some(false)) => None,
            (None, None) if format == ImageFormat::Jpeg => Some(DEFAULT_LOSSY_QUALITY),
            (None, None) => None,
        };

        let buffer = match quality {
            Some(q) => self.encoder.encode_lossy(&image, q)?,
            None => self.encoder.encode_lossless(&image)?,
        };

        tracing::debug!(
            ?format,
            width = dims.width,
            height = dims.height,
            ?quality,
            input = input.len(),
            output = buffer.len(),
            "image optimised"
        );
        Ok(OptimisedImage::new(input.len(), buffer, dims, quality))
    }

    /// Highest-quality lossy encode no larger than `target` bytes
    pub fn optimise_to_target(
        &self,
        input: &[u8],
        target: usize,
    ) -> Result<OptimisedImage, OptimiseError> {
        let Decoded { image, .. } = decode(input)?;
        let original = Dimensions::new(image.width(), image.height());
        // The search starts from a frame libwebp can encode.
        let start = original.fit_within(MAX_WEBP_EDGE);

        let encoder = &self.encoder;
        let mut frame: Option<(Dimensions, DynamicImage)> = None;
        let mut search = SizeSearch::new(target, |dims: Dimensions, quality: u8| {
            if frame.as_ref().map(|(d, _)| *d) != Some(dims) {
                // Resampled from the original each time, never from a previous frame.
                let resized = if dims == original {
                    image.clone()
                } else {
                    image.resize_exact(dims.width, dims.height, FilterType::Lanczos3)
                };
                frame = Some((dims, resized));
            }
            match &frame {
                Some((_, img)) => encoder.encode_lossy(img, quality),
                None => Err(OptimiseError::Encode("no frame to encode".to_string())),
            }
        });

        let outcome = search.run(start)?;
        tracing::debug!(
            encodes = search.encodes(),
            reductions = search.reductions(),
            target,
            "size-targeted search finished"
        );

        match outcome {
            SearchOutcome::Success(encoded) => Ok(OptimisedImage::new(
                input.len(),
                encoded.bytes,
                encoded.dimensions,
                Some(encoded.quality),
            )),
            SearchOutcome::Unreachable { smallest } => Err(OptimiseError::TargetUnreachable {
                target,
                width: smallest.width,
                height: smallest.height,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, Rgba};
    use std::io::Cursor;

    /// Deterministic noise so encoded sizes are not trivially small
    fn noise(width: u32, height: u32, alpha: bool) -> DynamicImage {
        let mut seed: u32 = 0x2545_f491;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed & 0xff) as u8
        };
        if alpha {
            DynamicImage::ImageRgba8(ImageBuffer::from_fn(width, height, |_, _| {
                Rgba([next(), next(), next(), next()])
            }))
        } else {
            DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |_, _| {
                Rgb([next(), next(), next()])
            }))
        }
    }

    fn encode_as(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_jpeg_defaults_to_lossy() {
        let input = encode_as(&noise(64, 48, false), ImageFormat::Jpeg);
        let result = Optimiser::webp().optimise(&input, OptimiseOptions::default()).unwrap();
        assert_eq!(result.quality, Some(DEFAULT_LOSSY_QUALITY));
        assert!(result.lossy);
        assert_eq!((result.width, result.height), (64, 48));
        assert_eq!(image::guess_format(&result.buffer).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn test_png_with_alpha_defaults_to_lossless_and_keeps_alpha() {
        let input = encode_as(&noise(32, 32, true), ImageFormat::Png);
        let result = Optimiser::webp().optimise(&input, OptimiseOptions::default()).unwrap();
        assert_eq!(result.quality, None);
        assert!(!result.lossy);
        let decoded = image::load_from_memory(&result.buffer).unwrap();
        assert!(decoded.color().has_alpha());
    }

    #[test]
    fn test_explicit_quality_wins() {
        let input = encode_as(&noise(32, 32, true), ImageFormat::Png);
        let options = OptimiseOptions {
            quality: Some(42),
            lossy: Some(false),
        };
        let result = Optimiser::webp().optimise(&input, options).unwrap();
        assert_eq!(result.quality, Some(42));
        assert!(result.compression_ratio > 0.0);
    }

    #[test]
    fn test_invalid_quality() {
        let input = encode_as(&noise(8, 8, false), ImageFormat::Png);
        let options = OptimiseOptions {
            quality: Some(101),
            lossy: None,
        };
        assert!(matches!(
            Optimiser::webp().optimise(&input, options),
            Err(OptimiseError::InvalidQuality(101))
        ));
    }

    #[test]
    fn test_unsupported_input() {
        let err = Optimiser::webp()
            .optimise(b"definitely not an image", OptimiseOptions::default())
            .unwrap_err();
        assert!(matches!(err, OptimiseError::UnsupportedFormat));
    }

    #[test]
    fn test_target_fits_at_max_quality() {
        let input = encode_as(&noise(40, 30, true), ImageFormat::Png);
        let result = Optimiser::webp()
            .optimise_to_target(&input, ALT_TARGET_BYTES)
            .unwrap();
        assert_eq!(result.quality, Some(crate::search::MAX_QUALITY));
        assert_eq!((result.width, result.height), (40, 30));
        let decoded = image::load_from_memory(&result.buffer).unwrap();
        assert!(decoded.color().has_alpha());
    }

    #[test]
    fn test_target_unreachable_at_floor() {
        let input = encode_as(&noise(1100, 200, false), ImageFormat::Png);
        let err = Optimiser::webp().optimise_to_target(&input, 64).unwrap_err();
        match err {
            OptimiseError::TargetUnreachable { width, height, .. } => {
                assert_eq!((width, height), (1100, 200));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            AppError::from(OptimiseError::TargetUnreachable {
                target: 1,
                width: 1,
                height: 1
            }),
            AppError::TargetUnreachable
        ));
    }

    #[test]
    fn test_oversized_edge_is_rejected() {
        let input = encode_as(&noise(17000, 4, false), ImageFormat::Png);
        let err = Optimiser::webp()
            .optimise(&input, OptimiseOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            OptimiseError::TooLarge {
                width: 17000,
                height: 4
            }
        ));
        assert!(matches!(AppError::from(err), AppError::Validation(_)));
    }

    #[test]
    fn test_oversized_edge_is_scaled_for_target() {
        let input = encode_as(&noise(17000, 4, false), ImageFormat::Png);
        let result = Optimiser::webp()
            .optimise_to_target(&input, ALT_TARGET_BYTES)
            .unwrap();
        assert_eq!((result.width, result.height), (MAX_WEBP_EDGE, 4));
        assert_eq!(image::guess_format(&result.buffer).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn test_content_filename() {
        let name = content_filename(b"abc", 1_700_000_000);
        assert_eq!(name, "1700000000-ba7816bf8f01cfea.webp");
    }
}
