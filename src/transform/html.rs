use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;

use super::{ContentKind, JsTransformer, TransformCtx, TransformOutput, Transformer};

static INLINE_SCRIPT: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?is)(<script\b[^>]*>)(.*?)(</script\s*>)").unwrap());

static SRC_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bsrc\s*="#).unwrap());

static TYPE_ATTR: Lazy<Regex> =
	Lazy::new(|| Regex::new(r#"(?i)\btype\s*=\s*["']?([^"'\s>]+)"#).unwrap());

static INTEGRITY_OR_NONCE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r#"(?i)\s+(?:integrity|nonce)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
});

static HEAD_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<head\b[^>]*>").unwrap());

/// Rewrites HTML documents for legacy targets.
///
/// Subresource integrity hashes and CSP nonces are removed because the
/// proxy rewrites the resources they cover. Inline scripts go through the
/// JS transformer; when `inject_polyfills` is set a polyfill loader is
/// inserted at the top of `<head>` so it runs before any page script.
pub struct HtmlTransformer {
	js: Arc<JsTransformer>,
}

impl HtmlTransformer {
	pub fn new(js: Arc<JsTransformer>) -> Self {
		Self { js }
	}

	fn rewrite_document(&self, html: &str, ctx: &TransformCtx<'_>) -> String {
		let stripped = INTEGRITY_OR_NONCE.replace_all(html, "");

		let rewritten = INLINE_SCRIPT.replace_all(&stripped, |caps: &regex::Captures<'_>| {
			let open = &caps[1];
			let body = &caps[2];
			let close = &caps[3];
			if SRC_ATTR.is_match(open) || !is_script_type_js(open) || body.trim().is_empty() {
				return caps[0].to_string();
			}
			format!("{}{}{}", open, self.js.rewrite_script(body, ctx), close)
		});

		let rewritten = rewritten.into_owned();
		if ctx.config.flags.inject_polyfills {
			let tag = format!(
				"<script src=\"{}\"></script>",
				ctx.config.polyfill_url.replace('"', "%22")
			);
			if let Some(m) = HEAD_OPEN.find(&rewritten) {
				let mut out = String::with_capacity(rewritten.len() + tag.len());
				out.push_str(&rewritten[..m.end()]);
				out.push_str(&tag);
				out.push_str(&rewritten[m.end()..]);
				return out;
			}
			// No <head>: prepend so the polyfill still loads first.
			return format!("{}{}", tag, rewritten);
		}

		rewritten
	}
}

/// True for script tags that hold JavaScript (no `type`, or a JS MIME).
fn is_script_type_js(open_tag: &str) -> bool {
	match TYPE_ATTR.captures(open_tag) {
		None => true,
		Some(caps) => {
			let t = caps[1].to_ascii_lowercase();
			matches!(
				t.as_str(),
				"text/javascript" | "application/javascript" | "module"
			)
		}
	}
}

impl Transformer for HtmlTransformer {
	fn can_handle(&self, kind: ContentKind) -> bool {
		kind == ContentKind::Html
	}

	fn transform(&self, input: &[u8], ctx: &TransformCtx<'_>) -> Result<TransformOutput> {
		let html = String::from_utf8_lossy(input);
		let rewritten = self.rewrite_document(&html, ctx);
		Ok(TransformOutput::unchanged(Bytes::from(rewritten)))
	}
}
