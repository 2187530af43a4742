use std::net::{IpAddr, SocketAddr};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use uuid::Uuid;

use crate::config::registry::PartialFlags;
use crate::error::ProxyError;
use crate::pac::{self, PacVariant};
use crate::pipeline::permissive_cors;
use crate::rules::ProfileDraft;
use crate::state::AppState;

/// The calling client's IP, inserted by the dispatcher for in-band
/// requests and derived from the socket for portal requests.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub IpAddr);

/// Build the `/__revamp__/` router. The same router answers in-band proxy
/// requests (driven through `tower::ServiceExt::oneshot`) and the captive
/// portal listener.
pub fn router(state: AppState) -> Router {
	Router::new()
		.route(
			"/__revamp__/config",
			get(get_config).post(post_config).delete(delete_config),
		)
		.route(
			"/__revamp__/domains",
			get(list_domains).post(create_domain),
		)
		.route(
			"/__revamp__/domains/{id}",
			get(get_domain).put(update_domain).delete(delete_domain),
		)
		.route("/__revamp__/domains/match/{host}", get(match_domain))
		.route("/__revamp__/pac/{variant}", get(get_pac))
		.route("/__revamp__/ca", get(get_ca))
		.route("/__revamp__/metrics", get(get_metrics))
		.route("/__revamp__/metrics/prometheus", get(get_metrics_prometheus))
		.route("/__revamp__/health", get(|| async { "OK" }))
		.fallback(not_found)
		.layer(middleware::from_fn(control_common))
		.layer(middleware::from_fn(ensure_client_addr))
		.with_state(state)
}

/// Shared control-plane behaviour: OPTIONS preflights answer 204, every
/// response carries the permissive CORS set and is uncacheable.
async fn control_common(req: axum::extract::Request, next: Next) -> Response {
	let origin = req.headers().get(header::ORIGIN).cloned();

	let mut resp = if req.method() == Method::OPTIONS {
		StatusCode::NO_CONTENT.into_response()
	} else {
		next.run(req).await
	};

	let headers = resp.headers_mut();
	for (name, value) in permissive_cors(origin.as_ref()) {
		headers.insert(name, value);
	}
	headers.insert(
		header::CACHE_CONTROL,
		HeaderValue::from_static("no-store, no-cache"),
	);
	resp
}

/// Guarantee a `ClientAddr` extension: the dispatcher inserts one for
/// in-band requests, the portal listener only provides `ConnectInfo`.
async fn ensure_client_addr(mut req: axum::extract::Request, next: Next) -> Response {
	if req.extensions().get::<ClientAddr>().is_none() {
		let ip = req
			.extensions()
			.get::<ConnectInfo<SocketAddr>>()
			.map(|info| info.0.ip())
			.unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]));
		req.extensions_mut().insert(ClientAddr(ip));
	}
	next.run(req).await
}

fn client_ip(req_ext: &axum::http::Extensions) -> IpAddr {
	req_ext
		.get::<ClientAddr>()
		.map(|c| c.0)
		.unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response {
	(
		status,
		[(header::CONTENT_TYPE, "application/json")],
		value.to_string(),
	)
		.into_response()
}

fn error_response(err: &ProxyError) -> Response {
	json_response(
		err.status_code(),
		json!({ "success": false, "error": err.to_string() }),
	)
}

async fn not_found() -> Response {
	json_response(
		StatusCode::NOT_FOUND,
		json!({ "success": false, "error": "no such endpoint" }),
	)
}

async fn get_config(
	State(state): State<AppState>,
	req: axum::extract::Request,
) -> Response {
	let ip = client_ip(req.extensions());
	let flags = state.registry.get_client_config(ip);
	json_response(StatusCode::OK, serde_json::to_value(flags).unwrap_or_default())
}

async fn post_config(
	State(state): State<AppState>,
	req: axum::extract::Request,
) -> Response {
	let ip = client_ip(req.extensions());
	let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
		Ok(b) => b,
		Err(e) => {
			return error_response(&ProxyError::Validation(format!("unreadable body: {}", e)));
		}
	};
	let patch: PartialFlags = match serde_json::from_slice(&body) {
		Ok(patch) => patch,
		Err(e) => {
			return error_response(&ProxyError::Validation(format!("invalid JSON: {}", e)));
		}
	};
	let flags = state.registry.merge_client_config(ip, &patch);
	json_response(StatusCode::OK, serde_json::to_value(flags).unwrap_or_default())
}

async fn delete_config(
	State(state): State<AppState>,
	req: axum::extract::Request,
) -> Response {
	let ip = client_ip(req.extensions());
	state.registry.reset_client(Some(ip));
	let flags = state.registry.get_client_config(ip);
	json_response(StatusCode::OK, serde_json::to_value(flags).unwrap_or_default())
}

async fn list_domains(State(state): State<AppState>) -> Response {
	let profiles = state.rules.list();
	json_response(
		StatusCode::OK,
		serde_json::to_value(profiles).unwrap_or_default(),
	)
}

async fn create_domain(State(state): State<AppState>, body: Bytes) -> Response {
	let draft: ProfileDraft = match serde_json::from_slice(&body) {
		Ok(draft) => draft,
		Err(e) => {
			return error_response(&ProxyError::Validation(format!("invalid JSON: {}", e)));
		}
	};
	match state.rules.create(draft) {
		Ok(profile) => json_response(
			StatusCode::CREATED,
			serde_json::to_value(profile).unwrap_or_default(),
		),
		Err(e) => error_response(&e),
	}
}

async fn get_domain(State(state): State<AppState>, Path(id): Path<String>) -> Response {
	let Ok(id) = Uuid::parse_str(&id) else {
		return error_response(&ProxyError::NotFound(format!("profile {}", id)));
	};
	match state.rules.get(id) {
		Some(profile) => json_response(
			StatusCode::OK,
			serde_json::to_value(profile).unwrap_or_default(),
		),
		None => error_response(&ProxyError::NotFound(format!("profile {}", id))),
	}
}

async fn update_domain(
	State(state): State<AppState>,
	Path(id): Path<String>,
	body: Bytes,
) -> Response {
	let Ok(id) = Uuid::parse_str(&id) else {
		return error_response(&ProxyError::NotFound(format!("profile {}", id)));
	};
	let draft: ProfileDraft = match serde_json::from_slice(&body) {
		Ok(draft) => draft,
		Err(e) => {
			return error_response(&ProxyError::Validation(format!("invalid JSON: {}", e)));
		}
	};
	match state.rules.update(id, draft) {
		Ok(profile) => json_response(
			StatusCode::OK,
			serde_json::to_value(profile).unwrap_or_default(),
		),
		Err(e) => error_response(&e),
	}
}

async fn delete_domain(State(state): State<AppState>, Path(id): Path<String>) -> Response {
	let Ok(id) = Uuid::parse_str(&id) else {
		return error_response(&ProxyError::NotFound(format!("profile {}", id)));
	};
	match state.rules.delete(id) {
		Ok(()) => json_response(StatusCode::OK, json!({ "success": true })),
		Err(e) => error_response(&e),
	}
}

async fn match_domain(State(state): State<AppState>, Path(host): Path<String>) -> Response {
	let matched = state.rules.match_for_domain(&host);
	let value = match matched {
		Some((profile, pattern)) => json!({
			"profile": serde_json::to_value(profile).unwrap_or_default(),
			"pattern": serde_json::to_value(pattern).unwrap_or_default(),
		}),
		None => json!({ "profile": null, "pattern": null }),
	};
	json_response(StatusCode::OK, value)
}

async fn get_pac(
	State(state): State<AppState>,
	Path(variant): Path<String>,
	req: axum::extract::Request,
) -> Response {
	let variant = match PacVariant::from_str(&variant) {
		Ok(v) => v,
		Err(e) => return error_response(&e),
	};
	// Address the PAC at whatever name the client reached us by.
	let proxy_host = req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(|h| crate::dispatch::host_of(h).to_string())
		.unwrap_or_else(|| state.settings.bind.clone());

	let body = pac::render(
		variant,
		&proxy_host,
		state.settings.socks_port,
		state.settings.http_port,
	);
	(
		StatusCode::OK,
		[(
			header::CONTENT_TYPE,
			"application/x-ns-proxy-autoconfig",
		)],
		body,
	)
		.into_response()
}

async fn get_ca(State(state): State<AppState>) -> Response {
	(
		StatusCode::OK,
		[
			(header::CONTENT_TYPE, "application/x-x509-ca-cert"),
			(
				header::CONTENT_DISPOSITION,
				"attachment; filename=\"revamp-proxy-ca.crt\"",
			),
		],
		state.ca.root_cert_pem().to_string(),
	)
		.into_response()
}

async fn get_metrics(State(state): State<AppState>) -> Response {
	json_response(
		StatusCode::OK,
		serde_json::to_value(state.metrics.snapshot()).unwrap_or_default(),
	)
}

async fn get_metrics_prometheus(State(state): State<AppState>) -> Response {
	(
		StatusCode::OK,
		[(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
		state.metrics.encode(),
	)
		.into_response()
}
