use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};

/// Central registry for all proxy metrics.
///
/// Counters and gauges are lock-free; callers update them directly from the
/// dispatcher and pipeline. `peak_connections` is maintained with a
/// compare-and-swap loop on every increment so the invariant
/// `peak >= max(active over lifetime)` holds without a lock.
pub struct MetricsRegistry {
	registry: Registry,

	// Request metrics
	pub requests_total: IntCounter,
	pub requests_blocked: IntCounter,
	pub requests_cached: IntCounter,
	pub requests_transformed: IntCounter,
	pub errors_total: IntCounter,

	// Per-kind transform metrics
	pub transforms_js: IntCounter,
	pub transforms_css: IntCounter,
	pub transforms_html: IntCounter,
	pub transforms_images: IntCounter,

	// Connection gauges
	pub active_connections: IntGauge,
	pub peak_connections: IntGauge,

	// Bandwidth accumulators (upstream raw bytes in, final bytes out)
	pub bytes_in: IntCounter,
	pub bytes_out: IntCounter,

	// Shadow atomics for the CAS peak update; gauges mirror these.
	active_shadow: AtomicI64,
	peak_shadow: AtomicI64,
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
	let c = IntCounter::with_opts(Opts::new(name, help).namespace("revamp")).unwrap();
	registry.register(Box::new(c.clone())).unwrap();
	c
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
	let g = IntGauge::with_opts(Opts::new(name, help).namespace("revamp")).unwrap();
	registry.register(Box::new(g.clone())).unwrap();
	g
}

impl MetricsRegistry {
	pub fn new() -> Self {
		let registry = Registry::new();

		let requests_total = int_counter(
			&registry,
			"requests_total",
			"Total number of proxied requests",
		);
		let requests_blocked = int_counter(
			&registry,
			"requests_blocked_total",
			"Requests blocked by ad or tracking rules",
		);
		let requests_cached = int_counter(
			&registry,
			"requests_cached_total",
			"Requests served from the transform cache",
		);
		let requests_transformed = int_counter(
			&registry,
			"requests_transformed_total",
			"Requests whose body was transformed",
		);
		let errors_total = int_counter(
			&registry,
			"errors_total",
			"Upstream and internal errors surfaced to clients",
		);

		let transforms_js = int_counter(
			&registry,
			"transforms_js_total",
			"JavaScript transform invocations",
		);
		let transforms_css = int_counter(
			&registry,
			"transforms_css_total",
			"CSS transform invocations",
		);
		let transforms_html = int_counter(
			&registry,
			"transforms_html_total",
			"HTML transform invocations",
		);
		let transforms_images = int_counter(
			&registry,
			"transforms_images_total",
			"Image conversion invocations",
		);

		let active_connections = int_gauge(
			&registry,
			"active_connections",
			"Currently open client connections",
		);
		let peak_connections = int_gauge(
			&registry,
			"peak_connections",
			"High-water mark of concurrently open client connections",
		);

		let bytes_in = int_counter(
			&registry,
			"bytes_in_total",
			"Raw bytes received from upstreams",
		);
		let bytes_out = int_counter(
			&registry,
			"bytes_out_total",
			"Final bytes written to clients",
		);

		Self {
			registry,
			requests_total,
			requests_blocked,
			requests_cached,
			requests_transformed,
			errors_total,
			transforms_js,
			transforms_css,
			transforms_html,
			transforms_images,
			active_connections,
			peak_connections,
			bytes_in,
			bytes_out,
			active_shadow: AtomicI64::new(0),
			peak_shadow: AtomicI64::new(0),
		}
	}

	/// Record a newly accepted connection and bump the peak if exceeded.
	pub fn connection_opened(&self) {
		let active = self.active_shadow.fetch_add(1, Ordering::AcqRel) + 1;
		self.active_connections.set(active);

		let mut peak = self.peak_shadow.load(Ordering::Acquire);
		while active > peak {
			match self.peak_shadow.compare_exchange_weak(
				peak,
				active,
				Ordering::AcqRel,
				Ordering::Acquire,
			) {
				Ok(_) => {
					self.peak_connections.set(active);
					break;
				}
				Err(observed) => peak = observed,
			}
		}
	}

	/// Record a closed connection.
	pub fn connection_closed(&self) {
		let active = self.active_shadow.fetch_sub(1, Ordering::AcqRel) - 1;
		self.active_connections.set(active);
	}

	/// Record bandwidth for one completed exchange.
	pub fn record_bandwidth(&self, upstream_bytes: u64, downstream_bytes: u64) {
		self.bytes_in.inc_by(upstream_bytes);
		self.bytes_out.inc_by(downstream_bytes);
	}

	/// Consistent point-in-time snapshot for the control plane.
	pub fn snapshot(&self) -> MetricsSnapshot {
		let bytes_in = self.bytes_in.get();
		let bytes_out = self.bytes_out.get();
		MetricsSnapshot {
			requests: RequestCounters {
				total: self.requests_total.get(),
				blocked: self.requests_blocked.get(),
				cached: self.requests_cached.get(),
				transformed: self.requests_transformed.get(),
			},
			transforms: TransformCounters {
				js: self.transforms_js.get(),
				css: self.transforms_css.get(),
				html: self.transforms_html.get(),
				images: self.transforms_images.get(),
			},
			errors: self.errors_total.get(),
			active_connections: self.active_shadow.load(Ordering::Acquire),
			peak_connections: self.peak_shadow.load(Ordering::Acquire),
			bytes_in,
			bytes_out,
			bytes_saved: bytes_in.saturating_sub(bytes_out),
		}
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				tracing::error!("failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

impl Default for MetricsRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestCounters {
	pub total: u64,
	pub blocked: u64,
	pub cached: u64,
	pub transformed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformCounters {
	pub js: u64,
	pub css: u64,
	pub html: u64,
	pub images: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
	pub requests: RequestCounters,
	pub transforms: TransformCounters,
	pub errors: u64,
	pub active_connections: i64,
	pub peak_connections: i64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub bytes_saved: u64,
}
