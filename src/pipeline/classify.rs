use crate::config::{ModernImageFormat, TargetBrowser, needs_image_downgrade};
use crate::transform::ContentKind;
use crate::transform::image::{looks_like_avif, looks_like_webp};

/// What the pipeline decided to do with a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
	/// Text-like content handled by one of the JS/CSS/HTML transformers.
	Text(ContentKind),
	/// Modern image format at least one target browser cannot decode.
	ImageDowngrade(ModernImageFormat),
	/// Recognized binary or unclassifiable content; never transformed.
	Skip,
}

/// Classify a response body.
///
/// Order matters: the image downgrade check runs first (WebP/AVIF by
/// content type or magic), then known binary signatures short-circuit, then
/// the content type decides. The URL extension is consulted only when no
/// content type was sent at all.
pub fn classify(
	content_type: Option<&str>,
	url: &str,
	body: &[u8],
	targets: &[TargetBrowser],
) -> Classification {
	let essence = content_type.map(essence_of);

	if let Some(format) = modern_image_format(essence.as_deref(), body) {
		if needs_image_downgrade(targets, format) {
			return Classification::ImageDowngrade(format);
		}
		return Classification::Skip;
	}

	if matches_known_binary(body) {
		return Classification::Skip;
	}

	let kind = match essence.as_deref() {
		Some(essence) => kind_from_content_type(essence),
		// URL-extension fallback only when content-type is absent.
		None => kind_from_extension(url),
	};

	match kind {
		ContentKind::Other => Classification::Skip,
		kind => Classification::Text(kind),
	}
}

/// The MIME essence: content type minus parameters, lowercased.
fn essence_of(content_type: &str) -> String {
	content_type
		.split(';')
		.next()
		.unwrap_or("")
		.trim()
		.to_ascii_lowercase()
}

fn modern_image_format(essence: Option<&str>, body: &[u8]) -> Option<ModernImageFormat> {
	match essence {
		Some("image/webp") => return Some(ModernImageFormat::WebP),
		Some("image/avif") => return Some(ModernImageFormat::Avif),
		_ => {}
	}
	if looks_like_webp(body) {
		return Some(ModernImageFormat::WebP);
	}
	if looks_like_avif(body) {
		return Some(ModernImageFormat::Avif);
	}
	None
}

/// First-bytes signatures of binary formats that must pass through
/// untouched.
fn matches_known_binary(body: &[u8]) -> bool {
	const MAGICS: &[&[u8]] = &[
		b"\x89PNG\r\n\x1a\n",       // PNG
		b"\xff\xd8\xff",            // JPEG
		b"GIF87a",                  // GIF
		b"GIF89a",                  // GIF
		b"%PDF-",                   // PDF
		b"PK\x03\x04",              // ZIP
		b"\x1f\x8b",                // gzip (unknown content-encoding survivor)
		b"wOFF",                    // WOFF
		b"wOF2",                    // WOFF2
		b"OTTO",                    // OpenType
		b"\x00\x01\x00\x00",        // TrueType
		b"\x00\x00\x01\x00",        // ICO
		b"BM",                      // BMP
		b"fLaC",                    // FLAC
		b"OggS",                    // Ogg
		b"\x1aE\xdf\xa3",           // Matroska / WebM
	];
	MAGICS.iter().any(|magic| body.starts_with(magic))
}

fn kind_from_content_type(essence: &str) -> ContentKind {
	match essence {
		"application/javascript"
		| "application/x-javascript"
		| "text/javascript"
		| "application/ecmascript"
		| "text/ecmascript" => ContentKind::Js,
		"text/css" => ContentKind::Css,
		"text/html" | "application/xhtml+xml" => ContentKind::Html,
		_ => ContentKind::Other,
	}
}

fn kind_from_extension(url: &str) -> ContentKind {
	let path = url
		.split(['?', '#'])
		.next()
		.unwrap_or(url)
		.to_ascii_lowercase();
	if path.ends_with(".js") || path.ends_with(".mjs") {
		ContentKind::Js
	} else if path.ends_with(".css") {
		ContentKind::Css
	} else if path.ends_with(".html") || path.ends_with(".htm") || path.ends_with('/') {
		ContentKind::Html
	} else {
		ContentKind::Other
	}
}
