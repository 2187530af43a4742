use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;

/// Decode a body according to its `Content-Encoding`.
///
/// Returns `None` when the encoding is unknown or decoding fails; the
/// caller passes the original bytes through in that case (decompression is
/// never fatal).
pub fn decode_body(encoding: &str, body: &[u8]) -> Option<Bytes> {
	match encoding.trim().to_ascii_lowercase().as_str() {
		"gzip" | "x-gzip" => {
			let mut out = Vec::with_capacity(body.len() * 4);
			GzDecoder::new(body).read_to_end(&mut out).ok()?;
			Some(Bytes::from(out))
		}
		"deflate" => {
			// Servers disagree on whether "deflate" means zlib-wrapped or
			// raw; try zlib first, then raw.
			let mut out = Vec::with_capacity(body.len() * 4);
			if ZlibDecoder::new(body).read_to_end(&mut out).is_ok() {
				return Some(Bytes::from(out));
			}
			let mut out = Vec::with_capacity(body.len() * 4);
			DeflateDecoder::new(body).read_to_end(&mut out).ok()?;
			Some(Bytes::from(out))
		}
		"br" => {
			let mut out = Vec::with_capacity(body.len() * 4);
			let mut reader = brotli::Decompressor::new(body, 4096);
			reader.read_to_end(&mut out).ok()?;
			Some(Bytes::from(out))
		}
		"identity" | "" => Some(Bytes::copy_from_slice(body)),
		_ => None,
	}
}

/// Gzip-compress a final body at `level` (clamped to 0..=9).
pub fn gzip_encode(body: &[u8], level: u32) -> std::io::Result<Bytes> {
	let mut encoder = GzEncoder::new(
		Vec::with_capacity(body.len() / 2),
		Compression::new(level.min(9)),
	);
	encoder.write_all(body)?;
	Ok(Bytes::from(encoder.finish()?))
}

/// Content types worth gzip-compressing on the way out.
pub fn is_compressible(content_type: &str) -> bool {
	let essence = content_type
		.split(';')
		.next()
		.unwrap_or("")
		.trim()
		.to_ascii_lowercase();
	if essence.starts_with("text/") {
		return true;
	}
	matches!(
		essence.as_str(),
		"application/json"
			| "application/javascript"
			| "application/x-javascript"
			| "application/xml"
			| "application/xhtml+xml"
			| "application/rss+xml"
			| "application/atom+xml"
			| "image/svg+xml"
	)
}
