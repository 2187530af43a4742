pub mod registry;

use anyhow::Result;
use serde::Deserialize;

/// Bootstrap configuration for the proxy process.
///
/// Values are loaded from (in order): `config` file (optional) and environment
/// variables prefixed with `RVP_` (e.g. `RVP_HTTP_PORT`), then overridden by
/// CLI flags in `main`. Runtime-mutable configuration (feature flags, ad and
/// tracking rules) lives in [`registry::ConfigRegistry`], not here.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Settings {
	/// Bind address shared by all listeners.
	pub bind: String,
	pub socks_port: u16,
	pub http_port: u16,
	pub portal_port: u16,
	/// Root of all persisted state: `certs/`, `data/`, `cache/`, `jsonlogs/`.
	pub data_dir: String,
	/// Comma-separated target browsers, e.g. `"safari 9, ios 9"`.
	pub targets: String,
	pub log_level: String,
	pub log_json: bool,
	/// First-byte read timeout on a freshly accepted connection, seconds.
	pub first_byte_timeout_secs: u64,
	pub upstream_timeout_secs: u64,
	pub tls_handshake_timeout_secs: u64,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			bind: "0.0.0.0".to_string(),
			socks_port: 1080,
			http_port: 8080,
			portal_port: 8888,
			data_dir: "./revamp-data".to_string(),
			targets: "safari 9, ios 9".to_string(),
			log_level: "info".to_string(),
			log_json: false,
			first_byte_timeout_secs: 30,
			upstream_timeout_secs: 30,
			tls_handshake_timeout_secs: 10,
		}
	}
}

/// Partial settings used to overlay environment/file values on top of defaults.
#[derive(Debug, Deserialize)]
struct PartialSettings {
	bind: Option<String>,
	socks_port: Option<u16>,
	http_port: Option<u16>,
	portal_port: Option<u16>,
	data_dir: Option<String>,
	targets: Option<String>,
	log_level: Option<String>,
	log_json: Option<bool>,
	first_byte_timeout_secs: Option<u64>,
	upstream_timeout_secs: Option<u64>,
	tls_handshake_timeout_secs: Option<u64>,
}

/// Load settings from config file (optional) and environment variables.
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("config").required(false))
		// Double-underscore separator so names like `RVP_HTTP_PORT` map to
		// `http_port` instead of a nested `http.port`.
		.add_source(config::Environment::with_prefix("RVP").separator("__"));

	let cfg = builder.build()?;
	let partial: PartialSettings = cfg.try_deserialize()?;

	let mut s = Settings::default();
	if let Some(bind) = partial.bind {
		s.bind = bind;
	}
	if let Some(p) = partial.socks_port {
		s.socks_port = p;
	}
	if let Some(p) = partial.http_port {
		s.http_port = p;
	}
	if let Some(p) = partial.portal_port {
		s.portal_port = p;
	}
	if let Some(d) = partial.data_dir {
		s.data_dir = d;
	}
	if let Some(t) = partial.targets {
		s.targets = t;
	}
	if let Some(l) = partial.log_level {
		s.log_level = l;
	}
	if let Some(j) = partial.log_json {
		s.log_json = j;
	}
	if let Some(t) = partial.first_byte_timeout_secs {
		s.first_byte_timeout_secs = t;
	}
	if let Some(t) = partial.upstream_timeout_secs {
		s.upstream_timeout_secs = t;
	}
	if let Some(t) = partial.tls_handshake_timeout_secs {
		s.tls_handshake_timeout_secs = t;
	}

	// Explicitly prefer direct environment variables when present. Some
	// environments (CI, test harnesses) set env vars in ways the `config`
	// crate doesn't map as expected; read them directly so explicit
	// overrides take effect.
	if let Ok(b) = std::env::var("RVP_BIND") {
		if !b.is_empty() {
			s.bind = b;
		}
	}
	if let Ok(p) = std::env::var("RVP_SOCKS_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.socks_port = pn;
		}
	}
	if let Ok(p) = std::env::var("RVP_HTTP_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.http_port = pn;
		}
	}
	if let Ok(p) = std::env::var("RVP_PORTAL_PORT") {
		if let Ok(pn) = p.parse::<u16>() {
			s.portal_port = pn;
		}
	}
	if let Ok(d) = std::env::var("RVP_DATA_DIR") {
		if !d.is_empty() {
			s.data_dir = d;
		}
	}
	if let Ok(t) = std::env::var("RVP_TARGETS") {
		if !t.is_empty() {
			s.targets = t;
		}
	}
	if let Ok(l) = std::env::var("RVP_LOG_LEVEL") {
		if !l.is_empty() {
			s.log_level = l;
		}
	}

	Ok(s)
}

/// A browser the proxy produces output for, e.g. `safari 9`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetBrowser {
	pub name: String,
	pub version: u32,
}

impl TargetBrowser {
	/// Parse a comma-separated list such as `"safari 9, ios 9"`. Entries
	/// that do not look like `<name> <major>` are skipped with a warning.
	pub fn parse_list(list: &str) -> Vec<TargetBrowser> {
		let mut out = Vec::new();
		for entry in list.split(',') {
			let entry = entry.trim();
			if entry.is_empty() {
				continue;
			}
			let mut parts = entry.split_whitespace();
			let name = match parts.next() {
				Some(n) => n.to_ascii_lowercase(),
				None => continue,
			};
			match parts.next().and_then(|v| v.parse::<u32>().ok()) {
				Some(version) => out.push(TargetBrowser { name, version }),
				None => {
					tracing::warn!(entry, "ignoring unparseable target browser");
				}
			}
		}
		out
	}

	/// First major version of this browser that can decode `format`
	/// natively. Unknown browsers are treated as current (no downgrade).
	fn format_support_cutoff(&self, format: ModernImageFormat) -> Option<u32> {
		match (self.name.as_str(), format) {
			("safari" | "ios", ModernImageFormat::WebP) => Some(14),
			("safari" | "ios", ModernImageFormat::Avif) => Some(16),
			("chrome", ModernImageFormat::WebP) => Some(32),
			("chrome", ModernImageFormat::Avif) => Some(85),
			("firefox", ModernImageFormat::WebP) => Some(65),
			("firefox", ModernImageFormat::Avif) => Some(93),
			("edge", ModernImageFormat::WebP) => Some(18),
			("edge", ModernImageFormat::Avif) => Some(121),
			_ => None,
		}
	}
}

/// Image formats the downgrade branch knows how to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModernImageFormat {
	WebP,
	Avif,
}

/// True when any configured target predates native support for `format`.
pub fn needs_image_downgrade(targets: &[TargetBrowser], format: ModernImageFormat) -> bool {
	targets.iter().any(|t| match t.format_support_cutoff(format) {
		Some(cutoff) => t.version < cutoff,
		None => false,
	})
}
