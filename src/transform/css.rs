use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;

use super::{ContentKind, TransformCtx, TransformOutput, Transformer};

static SOURCE_MAP_COMMENT: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"/\*#[ \t]*sourceMappingURL=[^*]*\*/").unwrap());

/// Normalizes stylesheets for legacy targets: line endings become LF and
/// sourcemap comments are removed.
pub struct CssTransformer;

impl CssTransformer {
	pub fn new() -> Self {
		Self
	}
}

impl Default for CssTransformer {
	fn default() -> Self {
		Self::new()
	}
}

impl Transformer for CssTransformer {
	fn can_handle(&self, kind: ContentKind) -> bool {
		kind == ContentKind::Css
	}

	fn transform(&self, input: &[u8], _ctx: &TransformCtx<'_>) -> Result<TransformOutput> {
		let source = String::from_utf8_lossy(input);
		let normalized = source.replace("\r\n", "\n");
		let stripped = SOURCE_MAP_COMMENT.replace_all(&normalized, "");
		Ok(TransformOutput::unchanged(Bytes::from(
			stripped.into_owned(),
		)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transform::test_support::effective_defaults;

	#[test]
	fn strips_sourcemap_comment_and_crlf() {
		let transformer = CssTransformer::new();
		let config = effective_defaults();
		let ctx = TransformCtx {
			url: "https://example.com/site.css",
			config: &config,
			source_content_type: Some("text/css"),
		};
		let out = transformer
			.transform(
				b"body { color: red; }\r\n/*# sourceMappingURL=site.css.map */\n",
				&ctx,
			)
			.unwrap();
		let body = String::from_utf8(out.body.to_vec()).unwrap();
		assert!(body.contains("body { color: red; }\n"));
		assert!(!body.contains("sourceMappingURL"));
		assert!(!body.contains('\r'));
	}
}
