use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Result;

use super::{ContentKind, TransformCtx, TransformOutput, Transformer};

static SOURCE_MAP_PRAGMA: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?m)^[ \t]*//[#@][ \t]*sourceMappingURL=\S*[ \t]*$").unwrap());

/// Rewrites JavaScript payloads for legacy targets.
///
/// Sourcemap pragmas point at files the proxy never serves, so they are
/// dropped. When `spoof_user_agent_in_js` is set a `navigator.userAgent`
/// shim is prepended so scripts observe the same identity the proxy sends
/// upstream.
pub struct JsTransformer;

impl JsTransformer {
	pub fn new() -> Self {
		Self
	}

	/// Shared entry point for standalone scripts and inline HTML scripts.
	pub fn rewrite_script(&self, source: &str, ctx: &TransformCtx<'_>) -> String {
		let body = SOURCE_MAP_PRAGMA.replace_all(source, "");
		if ctx.config.flags.spoof_user_agent_in_js {
			format!("{}{}", user_agent_shim(&ctx.config.user_agent), body)
		} else {
			body.into_owned()
		}
	}
}

impl Default for JsTransformer {
	fn default() -> Self {
		Self::new()
	}
}

fn user_agent_shim(user_agent: &str) -> String {
	let escaped = user_agent.replace('\\', "\\\\").replace('"', "\\\"");
	format!(
		"(function(){{try{{var ua=\"{}\";Object.defineProperty(navigator,\"userAgent\",{{get:function(){{return ua}}}});}}catch(e){{}}}})();\n",
		escaped
	)
}

impl Transformer for JsTransformer {
	fn can_handle(&self, kind: ContentKind) -> bool {
		kind == ContentKind::Js
	}

	fn transform(&self, input: &[u8], ctx: &TransformCtx<'_>) -> Result<TransformOutput> {
		let source = String::from_utf8_lossy(input);
		let rewritten = self.rewrite_script(&source, ctx);
		Ok(TransformOutput::unchanged(Bytes::from(rewritten)))
	}
}
