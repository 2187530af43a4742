use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use hyper::HeaderMap;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

/// One captured JSON exchange, written as
/// `<dir>/<clientIP>/<host>/<YYYY-MM-DD>/<hh.mm.ss>/<path>_<nonce>.json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord {
	url: String,
	timestamp: String,
	request_headers: BTreeMap<String, String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	request_body: Option<Value>,
	response_headers: BTreeMap<String, String>,
	data: Value,
}

/// Asynchronous writer for the JSON response log tree. Failures are logged
/// and swallowed; logging never affects the response path.
pub struct JsonLogger {
	root: PathBuf,
}

impl JsonLogger {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	/// Queue one exchange for logging. Returns immediately; the write runs
	/// on a background task.
	pub fn log_exchange(
		&self,
		client_ip: &str,
		host: &str,
		url: &str,
		path: &str,
		request_headers: &HeaderMap,
		request_body: Option<&[u8]>,
		response_headers: &HeaderMap,
		response_body: &[u8],
	) {
		let now = Utc::now();
		let dir = self
			.root
			.join(sanitize_component(client_ip))
			.join(sanitize_component(host))
			.join(now.format("%Y-%m-%d").to_string())
			.join(now.format("%H.%M.%S").to_string());

		let nonce: u32 = rand::thread_rng().r#gen();
		let file = format!("{}_{:08x}.json", sanitize_component(path), nonce);

		let record = LogRecord {
			url: url.to_string(),
			timestamp: now.to_rfc3339(),
			request_headers: headers_to_map(request_headers, false),
			request_body: request_body.map(parse_json_or_string),
			// content-encoding is dropped: the logged body is the decoded one.
			response_headers: headers_to_map(response_headers, true),
			data: parse_json_or_string(response_body),
		};

		tokio::spawn(async move {
			let path = dir.join(file);
			let write = async {
				tokio::fs::create_dir_all(&dir).await?;
				let body = serde_json::to_vec_pretty(&record)
					.map_err(|e| std::io::Error::other(e.to_string()))?;
				tokio::fs::write(&path, body).await
			};
			if let Err(e) = write.await {
				tracing::warn!(path = %path.display(), "json log write failed: {}", e);
			}
		});
	}
}

fn headers_to_map(headers: &HeaderMap, drop_content_encoding: bool) -> BTreeMap<String, String> {
	headers
		.iter()
		.filter(|(name, _)| {
			!(drop_content_encoding && name.as_str().eq_ignore_ascii_case("content-encoding"))
		})
		.map(|(name, value)| {
			(
				name.as_str().to_string(),
				String::from_utf8_lossy(value.as_bytes()).into_owned(),
			)
		})
		.collect()
}

fn parse_json_or_string(body: &[u8]) -> Value {
	serde_json::from_slice(body)
		.unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Collapse a URL path (or IP/host) into one safe file-name component.
fn sanitize_component(raw: &str) -> String {
	let cleaned: String = raw
		.trim_matches('/')
		.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
				c
			} else {
				'_'
			}
		})
		.collect();
	let trimmed = cleaned.trim_matches('.').to_string();
	if trimmed.is_empty() {
		"root".to_string()
	} else {
		// Keep names well under common filesystem limits.
		trimmed.chars().take(120).collect()
	}
}
