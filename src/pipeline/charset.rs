use bytes::Bytes;
use encoding_rs::Encoding;

/// The charset parameter of a `Content-Type`, if present.
pub fn charset_of(content_type: &str) -> Option<String> {
	content_type
		.split(';')
		.skip(1)
		.filter_map(|param| {
			let mut parts = param.splitn(2, '=');
			let name = parts.next()?.trim().to_ascii_lowercase();
			let value = parts.next()?.trim().trim_matches('"');
			(name == "charset").then(|| value.to_ascii_lowercase())
		})
		.next()
}

/// Decode `body` to UTF-8 according to the announced charset.
///
/// Returns `Some(utf8_bytes)` only when the body was actually re-encoded;
/// UTF-8 (and unknown charsets, which decode as UTF-8 by policy) return
/// `None` so the caller knows not to touch the `Content-Type`.
pub fn decode_to_utf8(body: &[u8], charset: &str) -> Option<Bytes> {
	let encoding = Encoding::for_label(charset.as_bytes())?;
	if encoding == encoding_rs::UTF_8 {
		return None;
	}
	let (decoded, _, had_errors) = encoding.decode(body);
	if had_errors {
		tracing::warn!(charset, "charset decode produced replacement characters");
	}
	Some(Bytes::from(decoded.into_owned()))
}

/// Rewrite a `Content-Type` so its charset parameter says UTF-8.
pub fn content_type_with_utf8(content_type: &str) -> String {
	let essence = content_type.split(';').next().unwrap_or("").trim();
	format!("{}; charset=UTF-8", essence)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn charset_parameter_extraction() {
		assert_eq!(
			charset_of("text/html; charset=Windows-1251").as_deref(),
			Some("windows-1251")
		);
		assert_eq!(
			charset_of("text/html; boundary=x; charset=\"ISO-8859-1\"").as_deref(),
			Some("iso-8859-1")
		);
		assert_eq!(charset_of("text/html"), None);
	}

	#[test]
	fn windows_1251_decodes() {
		// "Привет" in windows-1251
		let body: &[u8] = &[0xcf, 0xf0, 0xe8, 0xe2, 0xe5, 0xf2];
		let decoded = decode_to_utf8(body, "windows-1251").expect("re-encoded");
		assert_eq!(std::str::from_utf8(&decoded).unwrap(), "Привет");
	}

	#[test]
	fn latin1_decodes() {
		// "café" in ISO-8859-1
		let body: &[u8] = &[0x63, 0x61, 0x66, 0xe9];
		let decoded = decode_to_utf8(body, "iso-8859-1").expect("re-encoded");
		assert_eq!(std::str::from_utf8(&decoded).unwrap(), "café");
	}

	#[test]
	fn utf8_is_left_alone() {
		assert!(decode_to_utf8("привет".as_bytes(), "utf-8").is_none());
	}

	#[test]
	fn unknown_charset_is_left_alone() {
		assert!(decode_to_utf8(b"abc", "x-martian").is_none());
	}

	#[test]
	fn content_type_rewrite() {
		assert_eq!(
			content_type_with_utf8("text/html; charset=windows-1251"),
			"text/html; charset=UTF-8"
		);
		assert_eq!(content_type_with_utf8("text/css"), "text/css; charset=UTF-8");
	}
}
