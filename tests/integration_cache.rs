mod common;

use std::net::IpAddr;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};

fn ip(s: &str) -> IpAddr {
	s.parse().unwrap()
}

fn proxy_get(url: &str) -> Request<Full<Bytes>> {
	Request::builder()
		.method("GET")
		.uri(url)
		.body(Full::new(Bytes::new()))
		.unwrap()
}

/// Two concurrent requests for the same cold JS URL coalesce into exactly
/// one upstream fetch and one transform; both clients get byte-identical
/// bodies and the second counts as a cache hit.
#[tokio::test]
async fn concurrent_requests_coalesce_into_one_fetch() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let script = b"function f() { return 42; }\n";
	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "application/javascript")],
		script,
	);
	let (origin, connections) = common::spawn_origin(response).await;
	let url = format!("http://{}/bundle.js", origin);

	let d1 = dispatcher.clone();
	let d2 = dispatcher.clone();
	let url1 = url.clone();
	let url2 = url.clone();
	let (r1, r2) = tokio::join!(
		tokio::spawn(async move { d1.handle(proxy_get(&url1), ip("10.0.0.1"), "http", None).await }),
		tokio::spawn(async move { d2.handle(proxy_get(&url2), ip("10.0.0.2"), "http", None).await }),
	);
	let (r1, r2) = (r1.unwrap(), r2.unwrap());

	assert_eq!(r1.status(), StatusCode::OK);
	assert_eq!(r2.status(), StatusCode::OK);

	let b1 = r1.into_body().collect().await.unwrap().to_bytes();
	let b2 = r2.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(b1, b2);

	assert_eq!(connections.load(Ordering::SeqCst), 1, "one upstream fetch");
	let snap = state.metrics.snapshot();
	assert_eq!(snap.transforms.js, 1, "one transform invocation");
	assert_eq!(snap.requests.cached, 1, "second caller hit the flight");
	assert_eq!(snap.requests.transformed, 1);
}

/// A warm cache serves without touching the origin at all.
#[tokio::test]
async fn warm_cache_skips_the_origin() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "text/css")],
		b"a { color: blue }",
	);
	let (origin, connections) = common::spawn_origin(response).await;
	let url = format!("http://{}/site.css", origin);

	let r1 = dispatcher
		.handle(proxy_get(&url), ip("10.0.0.1"), "http", None)
		.await;
	assert_eq!(r1.status(), StatusCode::OK);
	assert_eq!(connections.load(Ordering::SeqCst), 1);

	let r2 = dispatcher
		.handle(proxy_get(&url), ip("10.0.0.3"), "http", None)
		.await;
	assert_eq!(r2.status(), StatusCode::OK);
	assert_eq!(connections.load(Ordering::SeqCst), 1, "no second fetch");
	assert_eq!(state.metrics.snapshot().requests.cached, 1);
}

/// When caching is disabled for the client, neither reads nor writes
/// touch the cache: every request refetches.
#[tokio::test]
async fn cache_disabled_bypasses_entirely() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;
	let alice = ip("10.0.0.9");

	state.registry.merge_client_config(
		alice,
		&revamp_proxy::config::registry::PartialFlags {
			cache_enabled: Some(false),
			..Default::default()
		},
	);

	let response = common::http_response(
		"HTTP/1.1 200 OK",
		&[("Content-Type", "application/javascript")],
		b"var y = 2;",
	);
	let (origin, connections) = common::spawn_origin(response).await;
	let url = format!("http://{}/y.js", origin);

	dispatcher
		.handle(proxy_get(&url), alice, "http", None)
		.await;
	dispatcher
		.handle(proxy_get(&url), alice, "http", None)
		.await;

	assert_eq!(connections.load(Ordering::SeqCst), 2, "both requests fetched");
	assert_eq!(state.metrics.snapshot().requests.cached, 0);
	assert_eq!(state.cache.entry_count(), 0, "nothing was stored");
}

/// A .js URL that answers with a redirect falls back to the verbatim
/// forwarding path and poisons the cache for that URL.
#[tokio::test]
async fn redirecting_asset_is_not_cached() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let response = common::http_response(
		"HTTP/1.1 301 Moved Permanently",
		&[("Location", "https://cdn.example.com/bundle.js")],
		b"",
	);
	let (origin, _connections) = common::spawn_origin(response).await;
	let url = format!("http://{}/bundle.js", origin);

	let resp = dispatcher
		.handle(proxy_get(&url), ip("10.0.0.1"), "http", None)
		.await;
	assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
	assert_eq!(
		resp.headers().get("location").unwrap(),
		"https://cdn.example.com/bundle.js"
	);
	assert!(state.cache.is_redirect(&url));
	assert_eq!(state.cache.entry_count(), 0);
}
