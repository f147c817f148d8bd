//! Thumbnail generation.
//!
//! Sources are decoded once per job; each target is then resized to its exact
//! dimensions and re-encoded. PNG sources stay PNG so transparency survives,
//! everything else is written as JPEG.

use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;
use image::io::{Limits, Reader};
use image::{DynamicImage, GenericImageView, ImageFormat, ImageOutputFormat};
use tracing::debug;

use crate::error::TransformError;
use crate::TargetSize;

/// An encoded thumbnail ready for upload.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    /// File extension used in the object key
    pub extension: &'static str,
    pub content_type: &'static str,
}

pub trait Resizer: Send + Sync + 'static {
    fn resize(
        &self,
        source: &DynamicImage,
        source_format: ImageFormat,
        target: TargetSize,
    ) -> Result<Thumbnail, TransformError>;
}

/// Largest source width or height the decoder accepts.
pub const MAX_SOURCE_DIMENSION: u32 = 16_384;

/// Decode raw bytes, keeping track of the container format.
///
/// Sources beyond [`MAX_SOURCE_DIMENSION`] or the decoder's default
/// allocation limit fail instead of being decoded.
pub fn decode(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), TransformError> {
    let mut reader = Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TransformError(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| TransformError("unrecognised image format".to_string()))?;

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_SOURCE_DIMENSION);
    limits.max_image_height = Some(MAX_SOURCE_DIMENSION);
    reader.limits(limits);

    let img = reader.decode()?;

    let (width, height) = img.dimensions();
    debug!(?format, width, height, "Decoded source image");

    Ok((img, format))
}

#[derive(Clone, Debug)]
pub struct ImageResizer {
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    pub filter: FilterType,
}

impl Default for ImageResizer {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            filter: FilterType::Lanczos3,
        }
    }
}

impl ImageResizer {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality,
            ..Self::default()
        }
    }
}

impl Resizer for ImageResizer {
    fn resize(
        &self,
        source: &DynamicImage,
        source_format: ImageFormat,
        target: TargetSize,
    ) -> Result<Thumbnail, TransformError> {
        if target.width == 0 || target.height == 0 {
            return Err(TransformError(format!("invalid target size {target}")));
        }

        let resized = source.resize_exact(target.width, target.height, self.filter);

        let mut buf = Cursor::new(Vec::new());
        let (extension, content_type) = match source_format {
            ImageFormat::Png => {
                resized.write_to(&mut buf, ImageOutputFormat::Png)?;
                ("png", "image/png")
            }
            _ => {
                // JPEG has no alpha channel
                DynamicImage::ImageRgb8(resized.to_rgb8())
                    .write_to(&mut buf, ImageOutputFormat::Jpeg(self.jpeg_quality))?;
                ("jpg", "image/jpeg")
            }
        };

        let data = Bytes::from(buf.into_inner());
        debug!(%target, size = data.len(), content_type, "Thumbnail encoded");

        Ok(Thumbnail {
            data,
            width: target.width,
            height: target.height,
            extension,
            content_type,
        })
    }
}
