pub mod charset;
pub mod classify;
pub mod decompress;

use std::net::IpAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Response, StatusCode};

use crate::cache::{CacheKey, CachedArtifact};
use crate::config::registry::EffectiveConfig;
use crate::error::ProxyError;
use crate::state::AppState;
use crate::transform::{ContentKind, TransformCtx};
use crate::upstream::FetchedResponse;

use classify::Classification;

/// Headers that apply to a single hop and must never be forwarded in
/// either direction.
pub const HOP_BY_HOP: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-connection",
	"proxy-authenticate",
	"proxy-authorization",
	"transfer-encoding",
	"upgrade",
	"te",
];

pub fn is_hop_by_hop(name: &str) -> bool {
	HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

const REDIRECT_STATUSES: &[u16] = &[301, 302, 303, 307, 308];

pub fn is_redirect_status(status: StatusCode) -> bool {
	REDIRECT_STATUSES.contains(&status.as_u16())
}

/// The permissive, credentialed CORS header set written on every response
/// leaving the proxy (and by the control plane).
pub fn permissive_cors(origin: Option<&HeaderValue>) -> Vec<(HeaderName, HeaderValue)> {
	let allow_origin = origin
		.cloned()
		.unwrap_or_else(|| HeaderValue::from_static("*"));
	vec![
		(
			HeaderName::from_static("access-control-allow-origin"),
			allow_origin,
		),
		(
			HeaderName::from_static("access-control-allow-credentials"),
			HeaderValue::from_static("true"),
		),
		(
			HeaderName::from_static("access-control-allow-methods"),
			HeaderValue::from_static("GET, POST, PUT, DELETE, PATCH, HEAD, OPTIONS"),
		),
		(
			HeaderName::from_static("access-control-allow-headers"),
			HeaderValue::from_static("*"),
		),
	]
}

/// Everything the pipeline needs to turn an upstream response into the
/// final client response.
pub struct PipelineInput {
	pub url: String,
	pub host: String,
	pub path: String,
	pub method: Method,
	pub client_ip: IpAddr,
	/// Original client request headers (pre hop-by-hop stripping).
	pub request_headers: HeaderMap,
	pub request_body: Option<Bytes>,
	pub upstream: FetchedResponse,
	pub config: EffectiveConfig,
}

/// Run the response pipeline: decompress, classify, transform through the
/// cache, recompress, normalize headers, account bandwidth, and mirror
/// JSON bodies into the log tree.
pub async fn run(state: &AppState, input: PipelineInput) -> Response<Full<Bytes>> {
	let PipelineInput {
		url,
		host,
		path,
		method: _,
		client_ip,
		request_headers,
		request_body,
		upstream,
		config,
	} = input;

	let upstream_raw_len = upstream.body.len() as u64;
	let status = upstream.status;
	let mut headers = upstream.headers;
	let mut body = upstream.body;
	let mut content_type = headers
		.get(hyper::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);

	// (a) Decompress. Non-fatal: undecodable bodies pass through with
	// their content-encoding intact and are never transformed.
	let mut decoded = true;
	if let Some(encoding) = headers
		.get(hyper::header::CONTENT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(str::to_ascii_lowercase)
	{
		if !encoding.is_empty() && encoding != "identity" {
			match decompress::decode_body(&encoding, &body) {
				Some(plain) => {
					body = plain;
					headers.remove(hyper::header::CONTENT_ENCODING);
				}
				None => {
					tracing::warn!(url = %url, encoding = %encoding, "could not decode body, passing through");
					decoded = false;
				}
			}
		}
	}

	// (b) Redirects: tombstone, never transform, forward with the
	// location header untouched.
	let is_redirect = is_redirect_status(status);
	if is_redirect {
		state.cache.mark_redirect(&url);
	}

	// (c)+(d) Classify and transform through the cache.
	let mut transformed_kind: Option<ContentKind> = None;
	if !is_redirect && decoded && !body.is_empty() {
		if body.len() > config.max_transform_bytes {
			tracing::warn!(
				url = %url,
				len = body.len(),
				cap = config.max_transform_bytes,
				"body exceeds transform cap, passing through"
			);
		} else {
			let classification =
				classify::classify(content_type.as_deref(), &url, &body, &state.targets);
			if let Some(kind) = transformable_kind(classification, &config) {
				match transform_with_cache(state, &url, kind, &body, content_type.as_deref(), &config)
					.await
				{
					Ok(Some((artifact, produced))) => {
						if produced {
							state.metrics.requests_transformed.inc();
							bump_transform_counter(state, kind);
							transformed_kind = Some(kind);
						} else {
							state.metrics.requests_cached.inc();
						}
						body = artifact.body.clone();
						if let Some(ct) = &artifact.content_type {
							content_type = Some(ct.clone());
						}
					}
					Ok(None) => {}
					Err(e) => {
						tracing::warn!(url = %url, kind = kind.as_str(), "transform failed, serving original: {}", e);
						state.metrics.errors_total.inc();
					}
				}
			}
		}
	}

	// Keep a copy of the decoded body for JSON logging before recompression.
	let logged_body = body.clone();
	let logged_headers = headers.clone();

	// (e) Conditional gzip of the final payload.
	let client_accepts_gzip = request_headers
		.get(hyper::header::ACCEPT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("gzip"))
		.unwrap_or(false);
	let compressible = content_type
		.as_deref()
		.map(decompress::is_compressible)
		.unwrap_or(false);
	let mut recompressed = false;
	if client_accepts_gzip && compressible && body.len() > 1024 && decoded && !is_redirect {
		match decompress::gzip_encode(&body, config.gzip_level) {
			Ok(compressed) => {
				body = compressed;
				recompressed = true;
			}
			Err(e) => tracing::warn!(url = %url, "gzip recompression failed: {}", e),
		}
	}

	// (f) Header normalization on the way out.
	let origin = request_headers.get(hyper::header::ORIGIN);
	let mut out = Response::builder().status(status);
	{
		let out_headers = out.headers_mut().expect("fresh builder");
		for (name, value) in headers.iter() {
			let n = name.as_str();
			if is_hop_by_hop(n)
				|| n.eq_ignore_ascii_case("content-length")
				|| n.to_ascii_lowercase().starts_with("content-security-policy")
				|| n.to_ascii_lowercase().starts_with("access-control-")
			{
				continue;
			}
			out_headers.append(name.clone(), value.clone());
		}
		if let Some(ct) = &content_type {
			if let Ok(v) = HeaderValue::from_str(ct) {
				out_headers.insert(hyper::header::CONTENT_TYPE, v);
			}
		}
		if recompressed {
			out_headers.insert(
				hyper::header::CONTENT_ENCODING,
				HeaderValue::from_static("gzip"),
			);
		}
		for (name, value) in permissive_cors(origin) {
			out_headers.insert(name, value);
		}
		out_headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
	}

	// (g) Bandwidth accounting, plus the transform record if one occurred.
	state
		.metrics
		.record_bandwidth(upstream_raw_len, body.len() as u64);
	if let Some(kind) = transformed_kind {
		tracing::debug!(url = %url, kind = kind.as_str(), "body transformed");
	}

	// (h) Async JSON logging, never on the response path.
	if config.json_log_enabled && is_json_content_type(content_type.as_deref()) {
		state.jsonlog.log_exchange(
			&client_ip.to_string(),
			&host,
			&url,
			&path,
			&request_headers,
			request_body.as_deref(),
			&logged_headers,
			&logged_body,
		);
	}

	match out.body(Full::new(body)) {
		Ok(resp) => resp,
		Err(e) => {
			tracing::error!(url = %url, "response build failed: {}", e);
			let mut resp = Response::new(Full::new(Bytes::new()));
			*resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
			resp
		}
	}
}

/// Fold a legacy charset to UTF-8, run the transformer for `kind`, and
/// assemble the cacheable artifact. Shared by the in-pipeline transform
/// step and the dispatcher's static-asset fast path, so both produce
/// byte-identical results for the same key.
pub(crate) fn produce_artifact(
	transformers: &crate::transform::TransformerSet,
	kind: ContentKind,
	body: &Bytes,
	url: &str,
	content_type: Option<&str>,
	config: &EffectiveConfig,
) -> crate::error::Result<CachedArtifact> {
	let transformer = transformers
		.for_kind(kind)
		.ok_or_else(|| ProxyError::Transform(format!("no transformer for {}", kind.as_str())))?;

	let (input, charset_changed) = match (kind, content_type) {
		(ContentKind::Image, _) | (_, None) => (body.clone(), false),
		(_, Some(ct)) => match charset::charset_of(ct)
			.and_then(|cs| charset::decode_to_utf8(body, &cs))
		{
			Some(decoded) => (decoded, true),
			None => (body.clone(), false),
		},
	};

	let ctx = TransformCtx {
		url,
		config,
		source_content_type: content_type,
	};
	let output = transformer.transform(&input, &ctx)?;

	let final_ct = output.content_type.clone().or_else(|| {
		if charset_changed {
			content_type.map(charset::content_type_with_utf8)
		} else {
			None
		}
	});
	Ok(CachedArtifact::new(output.body, final_ct))
}

/// Build the client response for a cached (or just-produced) artifact:
/// optional gzip, CORS, and an exact Content-Length. Used by the
/// dispatcher when serving the static-asset fast path.
pub(crate) fn respond_with_artifact(
	artifact: &CachedArtifact,
	fallback_content_type: &str,
	config: &EffectiveConfig,
	request_headers: &HeaderMap,
) -> Response<Full<Bytes>> {
	let mut body = artifact.body.clone();
	let content_type = artifact
		.content_type
		.clone()
		.unwrap_or_else(|| fallback_content_type.to_string());

	let client_accepts_gzip = request_headers
		.get(hyper::header::ACCEPT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("gzip"))
		.unwrap_or(false);
	let mut recompressed = false;
	if client_accepts_gzip && decompress::is_compressible(&content_type) && body.len() > 1024 {
		if let Ok(compressed) = decompress::gzip_encode(&body, config.gzip_level) {
			body = compressed;
			recompressed = true;
		}
	}

	let mut resp = Response::builder().status(StatusCode::OK);
	{
		let headers = resp.headers_mut().expect("fresh builder");
		if let Ok(v) = HeaderValue::from_str(&content_type) {
			headers.insert(hyper::header::CONTENT_TYPE, v);
		}
		if recompressed {
			headers.insert(
				hyper::header::CONTENT_ENCODING,
				HeaderValue::from_static("gzip"),
			);
		}
		for (name, value) in permissive_cors(request_headers.get(hyper::header::ORIGIN)) {
			headers.insert(name, value);
		}
		headers.insert(hyper::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
	}
	resp.body(Full::new(body)).expect("static headers are valid")
}

/// Map a classification onto the transformer kind, honoring the per-kind
/// feature flags from the effective config.
fn transformable_kind(
	classification: Classification,
	config: &EffectiveConfig,
) -> Option<ContentKind> {
	match classification {
		Classification::ImageDowngrade(_) => Some(ContentKind::Image),
		Classification::Text(ContentKind::Js) if config.flags.transform_js => Some(ContentKind::Js),
		Classification::Text(ContentKind::Css) if config.flags.transform_css => {
			Some(ContentKind::Css)
		}
		Classification::Text(ContentKind::Html) if config.flags.transform_html => {
			Some(ContentKind::Html)
		}
		_ => None,
	}
}

pub(crate) fn bump_transform_counter(state: &AppState, kind: ContentKind) {
	match kind {
		ContentKind::Js => state.metrics.transforms_js.inc(),
		ContentKind::Css => state.metrics.transforms_css.inc(),
		ContentKind::Html => state.metrics.transforms_html.inc(),
		ContentKind::Image => state.metrics.transforms_images.inc(),
		ContentKind::Other => {}
	}
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
	content_type
		.map(|ct| {
			let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
			essence == "application/json" || essence.ends_with("+json")
		})
		.unwrap_or(false)
}

/// Run the transformer for `kind`, deduplicated per `(url, kind)` through
/// the single-flight cache unless caching is disabled for this request.
async fn transform_with_cache(
	state: &AppState,
	url: &str,
	kind: ContentKind,
	body: &Bytes,
	content_type: Option<&str>,
	config: &EffectiveConfig,
) -> crate::error::Result<Option<(std::sync::Arc<CachedArtifact>, bool)>> {
	if state.transformers.for_kind(kind).is_none() {
		return Ok(None);
	}

	// The CPU work itself runs on the bounded transform pool.
	let produce = || async {
		let transformers = state.transformers.clone();
		let body = body.clone();
		let url = url.to_string();
		let content_type = content_type.map(str::to_string);
		let config = config.clone();
		state
			.transform_pool
			.run(move || {
				produce_artifact(
					&transformers,
					kind,
					&body,
					&url,
					content_type.as_deref(),
					&config,
				)
			})
			.await
	};

	if config.flags.cache_enabled {
		let key = CacheKey::new(url, kind);
		state.cache.do_cached(key, produce).await.map(Some)
	} else {
		// Cache bypass: neither read nor write.
		let artifact = produce().await?;
		Ok(Some((std::sync::Arc::new(artifact), true)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_by_hop_set() {
		assert!(is_hop_by_hop("Connection"));
		assert!(is_hop_by_hop("transfer-encoding"));
		assert!(!is_hop_by_hop("content-type"));
	}

	#[test]
	fn redirect_statuses() {
		for code in [301u16, 302, 303, 307, 308] {
			assert!(is_redirect_status(StatusCode::from_u16(code).unwrap()));
		}
		assert!(!is_redirect_status(StatusCode::OK));
		assert!(!is_redirect_status(StatusCode::NOT_MODIFIED));
	}

	#[test]
	fn cors_reflects_origin_when_present() {
		let origin = HeaderValue::from_static("https://example.com");
		let set = permissive_cors(Some(&origin));
		assert!(set.iter().any(|(n, v)| {
			n.as_str() == "access-control-allow-origin" && v == &origin
		}));

		let set = permissive_cors(None);
		assert!(set.iter().any(|(n, v)| {
			n.as_str() == "access-control-allow-origin" && v == "*"
		}));
	}

	#[test]
	fn json_content_types() {
		assert!(is_json_content_type(Some("application/json")));
		assert!(is_json_content_type(Some("application/hal+json; charset=utf-8")));
		assert!(!is_json_content_type(Some("text/html")));
		assert!(!is_json_content_type(None));
	}
}
