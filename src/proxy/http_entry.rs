use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::dispatch::{Dispatcher, host_of, simple_response};

use super::{bridge, mitm};

/// Serve one HTTP proxy connection: absolute-URI request lines (normal
/// proxy semantics), `CONNECT host:port` tunnelling, and origin-form
/// requests from misdirected clients (resolved via their `Host` header).
pub async fn serve<S>(stream: S, dispatcher: Arc<Dispatcher>, client_ip: IpAddr)
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let service = service_fn(move |req| {
		let dispatcher = dispatcher.clone();
		async move {
			Ok::<_, std::convert::Infallible>(handle_request(req, dispatcher, client_ip).await)
		}
	});

	let io = TokioIo::new(stream);
	let builder = AutoBuilder::new(TokioExecutor::new());
	if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
		tracing::debug!(client = %client_ip, "http proxy connection ended: {}", e);
	}
}

async fn handle_request(
	req: Request<hyper::body::Incoming>,
	dispatcher: Arc<Dispatcher>,
	client_ip: IpAddr,
) -> Response<Full<Bytes>> {
	if req.method() == Method::CONNECT {
		return handle_connect(req, dispatcher, client_ip).await;
	}
	dispatcher.handle(req, client_ip, "http", None).await
}

/// `CONNECT host:port`: dial (or begin MITM for 443) and hand the upgraded
/// byte stream to the tunnel driver. Ad-blocked hosts are refused at the
/// HTTP layer with 403 before any tunnel exists.
async fn handle_connect(
	req: Request<hyper::body::Incoming>,
	dispatcher: Arc<Dispatcher>,
	client_ip: IpAddr,
) -> Response<Full<Bytes>> {
	let authority = req
		.uri()
		.authority()
		.map(|a| a.as_str().to_string())
		.or_else(|| {
			req.headers()
				.get(hyper::header::HOST)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
		});
	let Some(authority) = authority else {
		return simple_response(StatusCode::BAD_REQUEST, "CONNECT without authority");
	};

	let host = host_of(&authority).to_string();
	let port = authority
		.rsplit_once(':')
		.and_then(|(_, p)| p.parse::<u16>().ok())
		.unwrap_or(443);

	// Blocked hosts never get a tunnel.
	let matched = dispatcher.state.rules.match_for_domain(&host);
	let config = dispatcher
		.state
		.registry
		.effective_for(client_ip, matched.as_ref().map(|(p, _)| p));
	if config.flags.remove_ads && config.ad_domains.iter().any(|d| host.contains(d.as_str())) {
		dispatcher.state.metrics.requests_blocked.inc();
		tracing::debug!(host = %host, "CONNECT refused for ad host");
		return simple_response(StatusCode::FORBIDDEN, "blocked");
	}

	// For non-443 tunnels, dial before replying so connection failures
	// surface as 502 instead of a dead tunnel.
	let upstream = if port == 443 {
		None
	} else {
		let timeout = Duration::from_secs(dispatcher.state.settings.upstream_timeout_secs);
		match tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port))).await {
			Ok(Ok(upstream)) => Some(upstream),
			Ok(Err(e)) => {
				tracing::debug!(host = %host, port = port, "CONNECT dial failed: {}", e);
				dispatcher.state.metrics.errors_total.inc();
				return simple_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
			}
			Err(_) => {
				dispatcher.state.metrics.errors_total.inc();
				return simple_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
			}
		}
	};

	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				let io = TokioIo::new(upgraded);
				match upstream {
					None => mitm::run_tunnel(io, host, dispatcher, client_ip).await,
					Some(upstream) => {
						let authority = if host.contains(':') {
							format!("[{}]:{}", host, port)
						} else {
							format!("{}:{}", host, port)
						};
						bridge::sniffed_tunnel(io, upstream, authority, dispatcher, client_ip)
							.await;
					}
				}
			}
			Err(e) => tracing::debug!("CONNECT upgrade failed: {}", e),
		}
	});

	// 200 with an empty body completes the CONNECT handshake; the
	// connection then upgrades to the tunnel.
	Response::new(Full::new(Bytes::new()))
}
