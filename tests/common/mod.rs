#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use revamp_proxy::build_state;
use revamp_proxy::config::Settings;
use revamp_proxy::config::registry::GlobalConfig;
use revamp_proxy::dispatch::Dispatcher;
use revamp_proxy::state::AppState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Build a full application state rooted in a temp directory, with the
/// default legacy targets and feature flags.
pub async fn test_state(dir: &tempfile::TempDir) -> AppState {
	let settings = Settings {
		data_dir: dir.path().to_string_lossy().into_owned(),
		..Settings::default()
	};
	build_state(settings, GlobalConfig::default())
		.await
		.expect("state builds")
}

pub async fn test_dispatcher(dir: &tempfile::TempDir) -> (AppState, Arc<Dispatcher>) {
	let state = test_state(dir).await;
	let dispatcher = Arc::new(Dispatcher::new(state.clone()));
	(state, dispatcher)
}

/// Spawn a one-response HTTP origin: every accepted connection reads one
/// request head and gets `response` written back verbatim. Returns the
/// bound address and a counter of accepted connections.
pub async fn spawn_origin(response: Vec<u8>) -> (SocketAddr, Arc<AtomicUsize>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
	let addr = listener.local_addr().expect("origin addr");
	let connections = Arc::new(AtomicUsize::new(0));

	let counter = connections.clone();
	tokio::spawn(async move {
		loop {
			let Ok((mut stream, _)) = listener.accept().await else {
				break;
			};
			counter.fetch_add(1, Ordering::SeqCst);
			let response = response.clone();
			tokio::spawn(async move {
				// Read until the end of the request head; the canned
				// responses carry explicit lengths so no body parsing is
				// needed.
				let mut buf = vec![0u8; 8192];
				let mut head = Vec::new();
				loop {
					match stream.read(&mut buf).await {
						Ok(0) => return,
						Ok(n) => {
							head.extend_from_slice(&buf[..n]);
							if head.windows(4).any(|w| w == b"\r\n\r\n") {
								break;
							}
						}
						Err(_) => return,
					}
				}
				let _ = stream.write_all(&response).await;
				let _ = stream.flush().await;
			});
		}
	});

	(addr, connections)
}

/// Assemble a canned HTTP/1.1 response with explicit content length.
pub fn http_response(status_line: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
	let mut out = Vec::new();
	out.extend_from_slice(status_line.as_bytes());
	out.extend_from_slice(b"\r\n");
	for (name, value) in headers {
		out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
	}
	out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
	out.extend_from_slice(b"Connection: close\r\n\r\n");
	out.extend_from_slice(body);
	out
}
