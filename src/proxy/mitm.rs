use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::dispatch::{Dispatcher, host_of};

/// Terminate TLS inside a CONNECT tunnel with a forged leaf for the
/// requested host, then serve the decrypted HTTP/1.1 requests through the
/// dispatcher as if they were plain requests for `https://host{path}`.
///
/// Failures before the first decrypted request close the tunnel silently;
/// once requests flow, upstream errors surface as 502 from the dispatcher.
pub async fn run_tunnel<S>(
	stream: S,
	tunnel_host: String,
	dispatcher: Arc<Dispatcher>,
	client_ip: IpAddr,
) where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let host = host_of(&tunnel_host).to_string();

	let minted = match dispatcher.state.leaf_cache.cert_for(&host).await {
		Ok(minted) => minted,
		Err(e) => {
			tracing::warn!(host = %host, "cannot mint leaf certificate: {}", e);
			return;
		}
	};

	let handshake_timeout =
		Duration::from_secs(dispatcher.state.settings.tls_handshake_timeout_secs);
	let acceptor = TlsAcceptor::from(minted.server_config.clone());
	let tls_stream =
		match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
			Ok(Ok(tls)) => tls,
			Ok(Err(e)) => {
				tracing::debug!(host = %host, client = %client_ip, "mitm handshake failed: {}", e);
				return;
			}
			Err(_) => {
				tracing::debug!(host = %host, client = %client_ip, "mitm handshake timed out");
				return;
			}
		};

	let service_host = host.clone();
	let service = service_fn(move |req| {
		let dispatcher = dispatcher.clone();
		let host = service_host.clone();
		async move {
			Ok::<_, std::convert::Infallible>(
				dispatcher
					.handle(req, client_ip, "https", Some(&host))
					.await,
			)
		}
	});

	let io = TokioIo::new(tls_stream);
	let builder = AutoBuilder::new(TokioExecutor::new());
	if let Err(e) = builder.serve_connection(io, service).await {
		tracing::debug!(host = %host, "mitm connection ended: {}", e);
	}
}
