mod common;

use std::io::Write;
use std::net::IpAddr;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use serde_json::json;

fn ip(s: &str) -> IpAddr {
	s.parse().unwrap()
}

fn proxy_get(url: &str, extra: &[(&str, &str)]) -> Request<Full<Bytes>> {
	let mut builder = Request::builder().method("GET").uri(url);
	for (name, value) in extra {
		builder = builder.header(*name, *value);
	}
	builder.body(Full::new(Bytes::new())).unwrap()
}

fn gzip(body: &[u8]) -> Vec<u8> {
	let mut enc = GzEncoder::new(Vec::new(), Compression::default());
	enc.write_all(body).unwrap();
	enc.finish().unwrap()
}

/// End to end through the dispatcher: a gzip HTML page with a CSP header
/// comes back transformed (polyfill injected), CSP-free, CORS'd, and with
/// an exact Content-Length.
#[tokio::test]
async fn html_is_decompressed_transformed_and_normalized() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let page = b"<html><head><title>t</title></head><body>hi</body></html>";
	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[
			("Content-Type", "text/html; charset=utf-8"),
			("Content-Encoding", "gzip"),
			("Content-Security-Policy", "default-src 'self'"),
			("X-Upstream", "kept"),
		],
		&gzip(page),
	);
	let (origin, _) = common::spawn_origin(response).await;

	let url = format!("http://{}/", origin);
	let resp = dispatcher
		.handle(
			proxy_get(&url, &[("origin", "https://site.example")]),
			ip("10.1.1.1"),
			"http",
			None,
		)
		.await;

	assert_eq!(resp.status(), StatusCode::OK);
	assert!(resp.headers().get("content-security-policy").is_none());
	assert_eq!(resp.headers().get("x-upstream").unwrap(), "kept");
	assert_eq!(
		resp.headers().get("access-control-allow-origin").unwrap(),
		"https://site.example"
	);

	let declared_len: usize = resp
		.headers()
		.get("content-length")
		.unwrap()
		.to_str()
		.unwrap()
		.parse()
		.unwrap();
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(body.len(), declared_len);

	let text = String::from_utf8_lossy(&body);
	assert!(text.contains("<body>hi</body>"));
	// Polyfill injection marks the HTML transform.
	assert!(text.contains("polyfill"));
	assert_eq!(state.metrics.snapshot().transforms.html, 1);
}

/// Ad hosts answer 204 and bump the blocked counter by exactly one.
#[tokio::test]
async fn ad_host_is_blocked_with_204() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let resp = dispatcher
		.handle(
			proxy_get("http://ads.doubleclick.net/pixel", &[]),
			ip("10.1.1.1"),
			"http",
			None,
		)
		.await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
	assert_eq!(state.metrics.snapshot().requests.blocked, 1);
}

/// Tracking URLs are blocked case-insensitively on the full URL.
#[tokio::test]
async fn tracking_url_is_blocked() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let resp = dispatcher
		.handle(
			proxy_get("http://cdn.example.com/GTAG/JS?id=1", &[]),
			ip("10.1.1.1"),
			"http",
			None,
		)
		.await;
	assert_eq!(resp.status(), StatusCode::NO_CONTENT);
	assert_eq!(state.metrics.snapshot().requests.blocked, 1);
}

/// Redirects are tombstoned, forwarded with Location intact, and never
/// cached.
#[tokio::test]
async fn redirects_are_forwarded_and_tombstoned() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let response = common::http_response(
		"HTTP/1.1 302 Found",
		&[("Location", "https://example.com/new")],
		b"",
	);
	let (origin, _) = common::spawn_origin(response).await;

	let url = format!("http://{}/old", origin);
	let resp = dispatcher
		.handle(proxy_get(&url, &[]), ip("10.1.1.1"), "http", None)
		.await;
	assert_eq!(resp.status(), StatusCode::FOUND);
	assert_eq!(
		resp.headers().get("location").unwrap(),
		"https://example.com/new"
	);
	assert!(state.cache.is_redirect(&url));
	assert_eq!(state.cache.entry_count(), 0);
}

/// A client override posted to the control plane turns the JS transformer
/// off for that client only; deleting it turns the transformer back on.
#[tokio::test]
async fn client_override_disables_js_transform() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;
	let alice = ip("192.168.1.5");

	let script = b"var x = 1;\n//# sourceMappingURL=x.js.map\n";
	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "application/javascript")],
		script,
	);
	let (origin, _) = common::spawn_origin(response).await;
	let url = format!("http://{}/app.js", origin);

	// Disable JS transforms for alice.
	let post = Request::builder()
		.method("POST")
		.uri("/__revamp__/config")
		.body(Full::new(Bytes::from(
			json!({"transformJs": false}).to_string(),
		)))
		.unwrap();
	dispatcher.handle(post, alice, "http", None).await;

	let resp = dispatcher
		.handle(proxy_get(&url, &[]), alice, "http", None)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	// Untransformed: the sourcemap pragma survives.
	assert!(String::from_utf8_lossy(&body).contains("sourceMappingURL"));
	assert_eq!(state.metrics.snapshot().transforms.js, 0);

	// Restore and fetch again (different URL to dodge the cache).
	let del = Request::builder()
		.method("DELETE")
		.uri("/__revamp__/config")
		.body(Full::new(Bytes::new()))
		.unwrap();
	dispatcher.handle(del, alice, "http", None).await;

	let url2 = format!("http://{}/app.js?v=2", origin);
	let resp = dispatcher
		.handle(proxy_get(&url2, &[]), alice, "http", None)
		.await;
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert!(!String::from_utf8_lossy(&body).contains("sourceMappingURL"));
	assert_eq!(state.metrics.snapshot().transforms.js, 1);
}

/// Final gzip only happens when the client advertises gzip, the type is
/// compressible, and the payload clears 1 KiB.
#[tokio::test]
async fn recompression_respects_accept_encoding_and_size() {
	let dir = tempfile::tempdir().unwrap();
	let (_state, dispatcher) = common::test_dispatcher(&dir).await;

	let big_css = "a{color:red}\n".repeat(200);
	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "text/css")],
		big_css.as_bytes(),
	);
	let (origin, _) = common::spawn_origin(response).await;
	let url = format!("http://{}/site.css", origin);

	// Client accepts gzip -> compressed.
	let resp = dispatcher
		.handle(
			proxy_get(&url, &[("accept-encoding", "gzip, deflate")]),
			ip("10.1.1.1"),
			"http",
			None,
		)
		.await;
	assert_eq!(resp.headers().get("content-encoding").unwrap(), "gzip");
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert!(body.len() < big_css.len());

	// No Accept-Encoding -> identity.
	let url2 = format!("http://{}/site.css?v=2", origin);
	let resp = dispatcher
		.handle(proxy_get(&url2, &[]), ip("10.1.1.1"), "http", None)
		.await;
	assert!(resp.headers().get("content-encoding").is_none());
}

/// A zero-length body is never transformed and accounts (0, 0) bandwidth.
#[tokio::test]
async fn empty_body_is_untouched() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let response =
		common::http_response("HTTP/1.1 200 OK", &[("Content-Type", "text/html")], b"");
	let (origin, _) = common::spawn_origin(response).await;
	let url = format!("http://{}/empty", origin);

	let resp = dispatcher
		.handle(proxy_get(&url, &[]), ip("10.1.1.1"), "http", None)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	let snap = state.metrics.snapshot();
	assert_eq!(snap.bytes_in, 0);
	assert_eq!(snap.bytes_out, 0);
	assert_eq!(snap.transforms.html, 0);
}

/// Unknown content-encoding passes the body through untransformed.
#[tokio::test]
async fn unknown_content_encoding_passes_through() {
	let dir = tempfile::tempdir().unwrap();
	let (_state, dispatcher) = common::test_dispatcher(&dir).await;

	let payload = b"\x01\x02\x03opaque";
	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[
			("Content-Type", "text/html"),
			("Content-Encoding", "zstd"),
		],
		payload,
	);
	let (origin, _) = common::spawn_origin(response).await;
	let url = format!("http://{}/opaque", origin);

	let resp = dispatcher
		.handle(proxy_get(&url, &[]), ip("10.1.1.1"), "http", None)
		.await;
	assert_eq!(resp.status(), StatusCode::OK);
	assert_eq!(resp.headers().get("content-encoding").unwrap(), "zstd");
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(body.as_ref(), payload);
}

/// Unreachable upstreams surface as 502 and count as errors.
#[tokio::test]
async fn upstream_failure_is_502() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let resp = dispatcher
		.handle(
			proxy_get("http://127.0.0.1:9/", &[]),
			ip("10.1.1.1"),
			"http",
			None,
		)
		.await;
	assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
	assert_eq!(state.metrics.snapshot().errors, 1);
}

/// Windows-1251 text is folded to UTF-8 and the content type says so.
#[tokio::test]
async fn legacy_charset_is_folded_to_utf8() {
	let dir = tempfile::tempdir().unwrap();
	let (_state, dispatcher) = common::test_dispatcher(&dir).await;

	// "<p>Привет</p>" with the cyrillic part in windows-1251.
	let mut page = b"<html><head></head><body><p>".to_vec();
	page.extend_from_slice(&[0xcf, 0xf0, 0xe8, 0xe2, 0xe5, 0xf2]);
	page.extend_from_slice(b"</p></body></html>");

	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "text/html; charset=windows-1251")],
		&page,
	);
	let (origin, _) = common::spawn_origin(response).await;
	let url = format!("http://{}/ru", origin);

	let resp = dispatcher
		.handle(proxy_get(&url, &[]), ip("10.1.1.1"), "http", None)
		.await;
	assert_eq!(
		resp.headers().get("content-type").unwrap(),
		"text/html; charset=UTF-8"
	);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert!(String::from_utf8_lossy(&body).contains("Привет"));
}
