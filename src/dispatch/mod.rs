use std::net::IpAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode};
use tower::ServiceExt;

use crate::control::{self, ClientAddr};
use crate::error::ProxyError;
use crate::pipeline::{self, PipelineInput, is_hop_by_hop};
use crate::state::AppState;

/// Path prefix owned by the control plane; requests under it are answered
/// by the proxy itself regardless of the addressed host, and are exempt
/// from blocking rules.
pub const RESERVED_PREFIX: &str = "/__revamp__/";

/// The request dispatcher: resolves effective configuration, applies
/// blocking, rewrites headers, executes the upstream fetch, and drives the
/// response pipeline. One dispatcher serves every front-end (SOCKS bridge,
/// HTTP proxy, MITM tunnels, captive portal).
pub struct Dispatcher {
	pub state: AppState,
	control: axum::Router,
}

impl Dispatcher {
	pub fn new(state: AppState) -> Self {
		let control = control::router(state.clone());
		Self { state, control }
	}

	/// Handle one parsed HTTP request.
	///
	/// `default_scheme` is inferred from the entry point (`https` inside a
	/// MITM tunnel); `forced_host` pins the authority for tunnelled
	/// requests whose request line is origin-form.
	pub async fn handle<B>(
		&self,
		req: Request<B>,
		client_ip: IpAddr,
		default_scheme: &str,
		forced_host: Option<&str>,
	) -> Response<Full<Bytes>>
	where
		B: hyper::body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<axum::BoxError> + std::fmt::Display,
	{
		self.state.metrics.requests_total.inc();

		let path = req.uri().path().to_string();
		if path.starts_with(RESERVED_PREFIX) {
			return self.dispatch_control(req, client_ip).await;
		}

		// Resolve the absolute target URL.
		let authority = forced_host
			.map(str::to_string)
			.or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
			.or_else(|| {
				req.headers()
					.get(hyper::header::HOST)
					.and_then(|v| v.to_str().ok())
					.map(str::to_string)
			});
		let Some(authority) = authority else {
			return simple_response(StatusCode::BAD_REQUEST, "missing target host");
		};
		let scheme = req
			.uri()
			.scheme_str()
			.unwrap_or(default_scheme)
			.to_string();
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| "/".to_string());
		let url = format!("{}://{}{}", scheme, authority, path_and_query);
		let host = host_of(&authority).to_string();

		// Effective configuration: global, then client overlay, then the
		// matched domain profile.
		let matched = self.state.rules.match_for_domain(&host);
		let config = self
			.state
			.registry
			.effective_for(client_ip, matched.as_ref().map(|(p, _)| p));

		// Blocking. The reserved prefix was already routed away, so
		// control traffic can never be swallowed by these rules.
		if config.flags.remove_ads && config.ad_domains.iter().any(|d| host.contains(d.as_str())) {
			self.state.metrics.requests_blocked.inc();
			tracing::debug!(host = %host, "ad-blocked");
			return simple_response(StatusCode::NO_CONTENT, "");
		}
		if config.flags.remove_tracking {
			let url_lower = url.to_ascii_lowercase();
			if config
				.tracking_patterns
				.iter()
				.any(|p| url_lower.contains(&p.to_ascii_lowercase()))
			{
				self.state.metrics.requests_blocked.inc();
				tracing::debug!(url = %url, "tracking-blocked");
				return simple_response(StatusCode::NO_CONTENT, "");
			}
		}

		let method = req.method().clone();
		let request_headers = req.headers().clone();

		// Static-asset fast path: when the URL alone names the content
		// kind, the whole fetch+transform runs inside the single-flight
		// group, so concurrent cold misses coalesce into one upstream
		// request and one transform.
		if method == hyper::Method::GET && config.flags.cache_enabled {
			if let Some(kind) = static_kind_of(&url).filter(|k| kind_enabled(*k, &config)) {
				if let Some(resp) = self
					.serve_static_cached(&url, kind, &request_headers, &config)
					.await
				{
					return resp;
				}
			}
		}

		let body = match req.into_body().collect().await {
			Ok(collected) => collected.to_bytes(),
			Err(e) => {
				return simple_response(
					StatusCode::BAD_REQUEST,
					&format!("failed to read request body: {}", e),
				);
			}
		};
		let request_body = (!body.is_empty()).then(|| body.clone());

		let upstream_headers = build_upstream_headers(&request_headers, &config);

		let fetched = match self
			.state
			.upstream
			.fetch(method.clone(), &url, upstream_headers, request_body.clone())
			.await
		{
			Ok(fetched) => fetched,
			Err(e) => {
				self.state.metrics.errors_total.inc();
				tracing::warn!(url = %url, "upstream fetch failed: {}", e);
				return simple_response(StatusCode::BAD_GATEWAY, "upstream error");
			}
		};

		pipeline::run(
			&self.state,
			PipelineInput {
				url,
				host,
				path,
				method,
				client_ip,
				request_headers,
				request_body,
				upstream: fetched,
				config,
			},
		)
		.await
	}

	/// Fetch-and-transform a static asset through the single-flight cache.
	/// Returns `None` when the upstream answer turned out not to be a
	/// cacheable 200 (redirect, error, mystery encoding); the caller then
	/// falls back to the full pipeline path.
	async fn serve_static_cached(
		&self,
		url: &str,
		kind: crate::transform::ContentKind,
		request_headers: &HeaderMap,
		config: &crate::config::registry::EffectiveConfig,
	) -> Option<Response<Full<Bytes>>> {
		use crate::cache::CacheKey;

		let key = CacheKey::new(url, kind);
		let state = &self.state;
		let upstream_headers = build_upstream_headers(request_headers, config);

		let result = state
			.cache
			.do_cached(key, || async {
				let fetched = state
					.upstream
					.fetch(hyper::Method::GET, url, upstream_headers, None)
					.await?;

				if pipeline::is_redirect_status(fetched.status) {
					state.cache.mark_redirect(url);
					return Err(ProxyError::Transform("redirect is not cacheable".into()));
				}
				if fetched.status != StatusCode::OK {
					return Err(ProxyError::Transform(format!(
						"status {} is not cacheable",
						fetched.status
					)));
				}

				let content_type = fetched
					.headers
					.get(hyper::header::CONTENT_TYPE)
					.and_then(|v| v.to_str().ok())
					.map(str::to_string);

				let raw_len = fetched.body.len();
				let mut body = fetched.body;
				if let Some(encoding) = fetched
					.headers
					.get(hyper::header::CONTENT_ENCODING)
					.and_then(|v| v.to_str().ok())
				{
					if !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity") {
						body = pipeline::decompress::decode_body(encoding, &body)
							.ok_or_else(|| {
								ProxyError::Transform(format!(
									"cannot decode {} body",
									encoding
								))
							})?;
					}
				}
				if body.is_empty() || body.len() > config.max_transform_bytes {
					return Err(ProxyError::Transform("body outside transform bounds".into()));
				}

				let artifact = {
					let transformers = state.transformers.clone();
					let url = url.to_string();
					let config = config.clone();
					state
						.transform_pool
						.run(move || {
							pipeline::produce_artifact(
								&transformers,
								kind,
								&body,
								&url,
								content_type.as_deref(),
								&config,
							)
						})
						.await?
				};
				state.metrics.record_bandwidth(raw_len as u64, 0);
				Ok(artifact)
			})
			.await;

		match result {
			Ok((artifact, produced)) => {
				if produced {
					state.metrics.requests_transformed.inc();
					pipeline::bump_transform_counter(state, kind);
				} else {
					state.metrics.requests_cached.inc();
				}
				let fallback_ct = match kind {
					crate::transform::ContentKind::Js => "application/javascript",
					crate::transform::ContentKind::Css => "text/css",
					_ => "application/octet-stream",
				};
				let resp = pipeline::respond_with_artifact(
					&artifact,
					fallback_ct,
					config,
					request_headers,
				);
				let out_len = resp
					.headers()
					.get(hyper::header::CONTENT_LENGTH)
					.and_then(|v| v.to_str().ok())
					.and_then(|v| v.parse::<u64>().ok())
					.unwrap_or(0);
				state.metrics.record_bandwidth(0, out_len);
				Some(resp)
			}
			Err(ProxyError::Upstream(e)) => {
				state.metrics.errors_total.inc();
				tracing::warn!(url = %url, "upstream fetch failed: {}", e);
				Some(simple_response(StatusCode::BAD_GATEWAY, "upstream error"))
			}
			// Not cacheable after all: take the ordinary path.
			Err(_) => None,
		}
	}

	/// Route a reserved-path request into the control-plane router.
	async fn dispatch_control<B>(&self, req: Request<B>, client_ip: IpAddr) -> Response<Full<Bytes>>
	where
		B: hyper::body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<axum::BoxError>,
	{
		let (mut parts, body) = req.into_parts();
		parts.extensions.insert(ClientAddr(client_ip));
		let req = Request::from_parts(parts, axum::body::Body::new(body));

		match self.control.clone().oneshot(req).await {
			Ok(resp) => {
				let (parts, body) = resp.into_parts();
				match body.collect().await {
					Ok(collected) => {
						Response::from_parts(parts, Full::new(collected.to_bytes()))
					}
					Err(e) => {
						tracing::error!("control body collect failed: {}", e);
						simple_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
					}
				}
			}
			Err(never) => match never {},
		}
	}
}

/// The content kind a URL names on its own, without a response to look
/// at. Only JS and CSS extensions are conclusive enough to gate the
/// fetch-inside-single-flight fast path.
fn static_kind_of(url: &str) -> Option<crate::transform::ContentKind> {
	let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
	if path.ends_with(".js") || path.ends_with(".mjs") {
		Some(crate::transform::ContentKind::Js)
	} else if path.ends_with(".css") {
		Some(crate::transform::ContentKind::Css)
	} else {
		None
	}
}

fn kind_enabled(
	kind: crate::transform::ContentKind,
	config: &crate::config::registry::EffectiveConfig,
) -> bool {
	match kind {
		crate::transform::ContentKind::Js => config.flags.transform_js,
		crate::transform::ContentKind::Css => config.flags.transform_css,
		crate::transform::ContentKind::Html => config.flags.transform_html,
		_ => false,
	}
}

/// Strip a port (if any) from an authority, tolerating IPv6 literals.
pub fn host_of(authority: &str) -> &str {
	if let Some(rest) = authority.strip_prefix('[') {
		return rest.split(']').next().unwrap_or(rest);
	}
	match authority.rsplit_once(':') {
		Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
		_ => authority,
	}
}

/// Copy request headers upstream, minus the hop-by-hop set and `Host`
/// (the client sets the latter from the URL). `Accept-Encoding` is forced
/// to identity so the pipeline sees plain bytes, except when JSON logging
/// wants the bandwidth win and accepts one decompression pass.
fn build_upstream_headers(
	request_headers: &HeaderMap,
	config: &crate::config::registry::EffectiveConfig,
) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in request_headers.iter() {
		let n = name.as_str();
		if is_hop_by_hop(n)
			|| n.eq_ignore_ascii_case("host")
			|| n.eq_ignore_ascii_case("accept-encoding")
			|| n.eq_ignore_ascii_case("content-length")
		{
			continue;
		}
		out.append(name.clone(), value.clone());
	}

	let accept_encoding = if config.json_log_enabled {
		"gzip, deflate"
	} else {
		"identity"
	};
	out.insert(
		hyper::header::ACCEPT_ENCODING,
		HeaderValue::from_static(accept_encoding),
	);

	if config.flags.spoof_user_agent {
		if let Ok(ua) = HeaderValue::from_str(&config.user_agent) {
			out.insert(hyper::header::USER_AGENT, ua);
		}
	}

	out
}

pub fn simple_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
	*resp.status_mut() = status;
	if !body.is_empty() {
		resp.headers_mut().insert(
			HeaderName::from_static("content-type"),
			HeaderValue::from_static("text/plain; charset=utf-8"),
		);
	}
	resp
}
