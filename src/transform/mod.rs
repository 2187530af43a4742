pub mod css;
pub mod html;
pub mod image;
pub mod js;
pub mod pool;

pub use css::CssTransformer;
pub use html::HtmlTransformer;
pub use image::ImageTransformer;
pub use js::JsTransformer;
pub use pool::TransformPool;

use std::sync::Arc;

use bytes::Bytes;

use crate::config::registry::EffectiveConfig;
use crate::error::Result;

/// The four content classes the pipeline distinguishes. `Other` is never
/// transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
	Js,
	Css,
	Html,
	Image,
	Other,
}

impl ContentKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			ContentKind::Js => "js",
			ContentKind::Css => "css",
			ContentKind::Html => "html",
			ContentKind::Image => "image",
			ContentKind::Other => "other",
		}
	}
}

/// Per-invocation context handed to a transformer.
pub struct TransformCtx<'a> {
	pub url: &'a str,
	pub config: &'a EffectiveConfig,
	/// The upstream `Content-Type`, when one was sent.
	pub source_content_type: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct TransformOutput {
	pub body: Bytes,
	/// Replacement `Content-Type`; `None` keeps the upstream value.
	pub content_type: Option<String>,
}

impl TransformOutput {
	pub fn unchanged(body: Bytes) -> Self {
		Self {
			body,
			content_type: None,
		}
	}
}

/// A content rewriter for one or more [`ContentKind`]s.
///
/// Implementations must be deterministic for a given `(input, url, config)`
/// triple: the transform cache serves a stored output to every later
/// request with the same key, so two invocations must never legitimately
/// disagree. Failures are recoverable by contract; the pipeline serves the
/// original bytes when a transformer errors.
pub trait Transformer: Send + Sync {
	fn can_handle(&self, kind: ContentKind) -> bool;
	fn transform(&self, input: &[u8], ctx: &TransformCtx<'_>) -> Result<TransformOutput>;
}

/// The transformer adapters wired into the pipeline, one per kind. HTML
/// composes the JS transformer for inline scripts at the call site.
pub struct TransformerSet {
	js: Arc<JsTransformer>,
	css: Arc<CssTransformer>,
	html: Arc<HtmlTransformer>,
	image: Arc<ImageTransformer>,
}

impl TransformerSet {
	pub fn new() -> Self {
		let js = Arc::new(JsTransformer::new());
		Self {
			css: Arc::new(CssTransformer::new()),
			html: Arc::new(HtmlTransformer::new(js.clone())),
			image: Arc::new(ImageTransformer::new()),
			js,
		}
	}

	pub fn for_kind(&self, kind: ContentKind) -> Option<Arc<dyn Transformer>> {
		match kind {
			ContentKind::Js => Some(self.js.clone()),
			ContentKind::Css => Some(self.css.clone()),
			ContentKind::Html => Some(self.html.clone()),
			ContentKind::Image => Some(self.image.clone()),
			ContentKind::Other => None,
		}
	}
}

impl Default for TransformerSet {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use crate::config::registry::{ConfigRegistry, EffectiveConfig};

	pub fn effective_defaults() -> EffectiveConfig {
		ConfigRegistry::default().effective_for("127.0.0.1".parse().unwrap(), None)
	}
}
