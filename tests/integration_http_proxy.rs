mod common;

use revamp_proxy::proxy::{self, Role};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Absolute-URI proxying: a classic HTTP/1.1 proxy request is fetched
/// upstream and the rewritten response comes back on the same socket.
#[tokio::test]
async fn absolute_uri_request_is_proxied() {
	let dir = tempfile::tempdir().unwrap();
	let (_state, dispatcher) = common::test_dispatcher(&dir).await;

	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "text/plain")],
		b"proxied payload",
	);
	let (origin, _) = common::spawn_origin(response).await;

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let proxy_addr = listener.local_addr().unwrap();
	tokio::spawn(proxy::serve(listener, Role::Http, dispatcher));

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	let request = format!(
		"GET http://{}/data HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
		origin, origin
	);
	client.write_all(request.as_bytes()).await.unwrap();

	let mut raw = Vec::new();
	client.read_to_end(&mut raw).await.unwrap();
	let text = String::from_utf8_lossy(&raw);
	assert!(text.starts_with("HTTP/1.1 200"), "got: {}", text);
	assert!(text.contains("proxied payload"));
	// Permissive CORS is written on the way out.
	assert!(text.to_ascii_lowercase().contains("access-control-allow-origin"));
}

/// CONNECT to a known ad host is refused at the HTTP layer with 403 and
/// counts as exactly one blocked request.
#[tokio::test]
async fn connect_to_ad_host_is_refused() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let proxy_addr = listener.local_addr().unwrap();
	tokio::spawn(proxy::serve(listener, Role::Http, dispatcher));

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(b"CONNECT ads.doubleclick.net:443 HTTP/1.1\r\nHost: ads.doubleclick.net:443\r\n\r\n")
		.await
		.unwrap();

	let mut buf = vec![0u8; 1024];
	let n = client.read(&mut buf).await.unwrap();
	let text = String::from_utf8_lossy(&buf[..n]);
	assert!(text.starts_with("HTTP/1.1 403"), "got: {}", text);
	assert_eq!(state.metrics.snapshot().requests.blocked, 1);
}

/// The reserved control-plane prefix answers in-band on the proxy port,
/// no matter which host was addressed.
#[tokio::test]
async fn control_plane_answers_in_band() {
	let dir = tempfile::tempdir().unwrap();
	let (_state, dispatcher) = common::test_dispatcher(&dir).await;

	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let proxy_addr = listener.local_addr().unwrap();
	tokio::spawn(proxy::serve(listener, Role::Http, dispatcher));

	let mut client = TcpStream::connect(proxy_addr).await.unwrap();
	client
		.write_all(
			b"GET /__revamp__/health HTTP/1.1\r\nHost: anything.example\r\nConnection: close\r\n\r\n",
		)
		.await
		.unwrap();

	let mut raw = Vec::new();
	client.read_to_end(&mut raw).await.unwrap();
	let text = String::from_utf8_lossy(&raw);
	assert!(text.starts_with("HTTP/1.1 200"), "got: {}", text);
	assert!(text.ends_with("OK"));
}
