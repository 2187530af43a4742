mod common;

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerName};
use x509_parser::extensions::{GeneralName, ParsedExtension};

use revamp_proxy::proxy::mitm;

/// Build a rustls client that trusts only the test CA root.
fn client_config(ca_der: &[u8]) -> Arc<ClientConfig> {
	let mut roots = RootCertStore::empty();
	roots
		.add(&rustls::Certificate(ca_der.to_vec()))
		.expect("CA root loads");
	Arc::new(
		ClientConfig::builder()
			.with_safe_defaults()
			.with_root_certificates(roots)
			.with_no_client_auth(),
	)
}

/// Scenario: a tunnel for `mitm.test` is terminated with a forged leaf.
/// The handshake succeeds against a client that trusts the proxy CA, the
/// presented certificate carries the host and wildcard SANs, and once a
/// request is read the unreachable upstream surfaces as 502 on the
/// decrypted channel.
#[tokio::test]
async fn forged_leaf_handshake_and_502_inside_tunnel() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	let (client_io, server_io) = tokio::io::duplex(16 * 1024);
	let tunnel = tokio::spawn(mitm::run_tunnel(
		server_io,
		"mitm.test".to_string(),
		dispatcher,
		"10.0.0.1".parse().unwrap(),
	));

	let connector = TlsConnector::from(client_config(state.ca.root_cert_der()));
	let server_name = ServerName::try_from("mitm.test").unwrap();
	let mut tls = connector
		.connect(server_name, client_io)
		.await
		.expect("handshake against forged leaf succeeds");

	// Inspect the presented leaf: CN and SANs must name the host.
	{
		let (_, session) = tls.get_ref();
		let certs = session.peer_certificates().expect("certs presented");
		assert!(certs.len() >= 2, "leaf plus CA in the chain");
		let (_, leaf) = x509_parser::parse_x509_certificate(&certs[0].0).unwrap();

		let cn = leaf
			.subject()
			.iter_common_name()
			.next()
			.and_then(|c| c.as_str().ok())
			.unwrap();
		assert_eq!(cn, "mitm.test");

		let mut dns = Vec::new();
		for ext in leaf.extensions() {
			if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
				for name in &san.general_names {
					if let GeneralName::DNSName(d) = name {
						dns.push(d.to_string());
					}
				}
			}
		}
		assert!(dns.contains(&"mitm.test".to_string()));
		assert!(dns.contains(&"*.mitm.test".to_string()));
	}

	// `mitm.test` resolves nowhere, so the dispatched request must come
	// back as 502 over the tunnel.
	tls.write_all(b"GET / HTTP/1.1\r\nHost: mitm.test\r\nConnection: close\r\n\r\n")
		.await
		.unwrap();
	let mut response = Vec::new();
	let _ = tls.read_to_end(&mut response).await;
	let text = String::from_utf8_lossy(&response);
	assert!(text.starts_with("HTTP/1.1 502"), "got: {}", text);

	drop(tls);
	let _ = tunnel.await;
}

/// The same host is minted once: a second tunnel reuses the cached leaf.
#[tokio::test]
async fn leaf_cache_is_reused_across_tunnels() {
	let dir = tempfile::tempdir().unwrap();
	let (state, dispatcher) = common::test_dispatcher(&dir).await;

	for _ in 0..2 {
		let (client_io, server_io) = tokio::io::duplex(16 * 1024);
		let tunnel = tokio::spawn(mitm::run_tunnel(
			server_io,
			"reuse.test".to_string(),
			dispatcher.clone(),
			"10.0.0.1".parse().unwrap(),
		));
		let connector = TlsConnector::from(client_config(state.ca.root_cert_der()));
		let tls = connector
			.connect(ServerName::try_from("reuse.test").unwrap(), client_io)
			.await
			.expect("handshake");
		drop(tls);
		let _ = tunnel.await;
	}

	assert_eq!(state.leaf_cache.len(), 1);
}

/// Garbage instead of a ClientHello closes the tunnel silently.
#[tokio::test]
async fn non_tls_bytes_close_the_tunnel() {
	let dir = tempfile::tempdir().unwrap();
	let (_state, dispatcher) = common::test_dispatcher(&dir).await;

	let (mut client_io, server_io) = tokio::io::duplex(4096);
	let tunnel = tokio::spawn(mitm::run_tunnel(
		server_io,
		"garbage.test".to_string(),
		dispatcher,
		"10.0.0.1".parse().unwrap(),
	));

	client_io.write_all(b"not a client hello at all").await.unwrap();
	// The server side gives up and closes; at most a TLS alert comes back,
	// never an HTTP response.
	let mut buf = Vec::new();
	let _ = client_io.read_to_end(&mut buf).await;
	assert!(!buf.starts_with(b"HTTP/"));
	tunnel.await.expect("tunnel task exits cleanly");
}
