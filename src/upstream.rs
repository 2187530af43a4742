use std::time::Duration;

use bytes::Bytes;
use hyper::{HeaderMap, Method, StatusCode};

use crate::error::{ProxyError, Result};

/// An upstream response, fully buffered. The pipeline cannot stream
/// (transforms need the whole body), so buffering here keeps the contract
/// in one place.
#[derive(Debug)]
pub struct FetchedResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// HTTP client used for all origin fetches.
///
/// Redirects are never followed (they are forwarded to the client and
/// tombstoned), and upstream certificates are not verified: this is an
/// interception proxy, the client already trusts our forged chain instead.
pub struct UpstreamClient {
	client: reqwest::Client,
}

impl UpstreamClient {
	pub fn new(timeout: Duration) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::none())
			.danger_accept_invalid_certs(true)
			.timeout(timeout)
			.build()?;
		Ok(Self { client })
	}

	/// Execute one request and buffer the response.
	pub async fn fetch(
		&self,
		method: Method,
		url: &str,
		headers: HeaderMap,
		body: Option<Bytes>,
	) -> Result<FetchedResponse> {
		let mut req = self.client.request(method, url).headers(headers);
		if let Some(body) = body {
			req = req.body(body);
		}

		let resp = req
			.send()
			.await
			.map_err(|e| ProxyError::Upstream(format!("{}: {}", url, e)))?;

		let status = resp.status();
		let headers = resp.headers().clone();
		let body = resp
			.bytes()
			.await
			.map_err(|e| ProxyError::Upstream(format!("reading body from {}: {}", url, e)))?;

		Ok(FetchedResponse {
			status,
			headers,
			body,
		})
	}
}
