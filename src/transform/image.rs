use std::io::Cursor;

use bytes::Bytes;
use image::ImageOutputFormat;

use crate::error::{ProxyError, Result};

use super::{ContentKind, TransformCtx, TransformOutput, Transformer};

const JPEG_QUALITY: u8 = 82;

/// Converts modern image formats to JPEG for targets that predate them.
///
/// WebP decodes through the `image` crate. AVIF is detected but has no
/// in-tree decoder; the error propagates and the pipeline serves the
/// original bytes, which is the contract for every transform failure.
pub struct ImageTransformer;

impl ImageTransformer {
	pub fn new() -> Self {
		Self
	}
}

impl Default for ImageTransformer {
	fn default() -> Self {
		Self::new()
	}
}

/// RIFF....WEBP container magic.
pub fn looks_like_webp(bytes: &[u8]) -> bool {
	bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP"
}

/// ISO-BMFF `ftyp` box with an avif/avis brand.
pub fn looks_like_avif(bytes: &[u8]) -> bool {
	bytes.len() >= 12
		&& &bytes[4..8] == b"ftyp"
		&& (&bytes[8..12] == b"avif" || &bytes[8..12] == b"avis")
}

impl Transformer for ImageTransformer {
	fn can_handle(&self, kind: ContentKind) -> bool {
		kind == ContentKind::Image
	}

	fn transform(&self, input: &[u8], ctx: &TransformCtx<'_>) -> Result<TransformOutput> {
		let decoded = image::load_from_memory(input).map_err(|e| {
			ProxyError::Transform(format!("cannot decode image at {}: {}", ctx.url, e))
		})?;

		let mut jpeg = Cursor::new(Vec::with_capacity(input.len()));
		decoded
			.to_rgb8()
			.write_to(&mut jpeg, ImageOutputFormat::Jpeg(JPEG_QUALITY))
			.map_err(|e| {
				ProxyError::Transform(format!("cannot encode JPEG for {}: {}", ctx.url, e))
			})?;

		Ok(TransformOutput {
			body: Bytes::from(jpeg.into_inner()),
			content_type: Some("image/jpeg".to_string()),
		})
	}
}
