pub mod ca;
pub mod cache;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod jsonlog;
pub mod observability;
pub mod pac;
pub mod pipeline;
pub mod proxy;
pub mod rules;
pub mod state;
pub mod transform;
pub mod upstream;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::ca::{CertificateAuthority, LeafCache};
use crate::cache::{CacheConfig, TransformCache};
use crate::config::registry::{ConfigRegistry, GlobalConfig};
use crate::config::{Settings, TargetBrowser};
use crate::dispatch::Dispatcher;
use crate::jsonlog::JsonLogger;
use crate::observability::MetricsRegistry;
use crate::rules::RuleEngine;
use crate::state::AppState;
use crate::transform::{TransformPool, TransformerSet};
use crate::upstream::UpstreamClient;

/// Leaf certificates kept hot before LRU eviction kicks in.
const LEAF_CACHE_CAPACITY: usize = 256;

/// Assemble the shared application state under `settings.data_dir`.
///
/// This is the composition root: everything here is owned by the returned
/// state and nothing is process-global, so tests can build as many
/// instances as they like against temp directories.
pub async fn build_state(settings: Settings, global: GlobalConfig) -> anyhow::Result<AppState> {
	let data_dir = Path::new(&settings.data_dir);
	let certs_dir = data_dir.join("certs");
	let rules_path = data_dir.join("data").join("domain-rules.json");
	let cache_dir = data_dir.join("cache");
	let jsonlog_dir = data_dir.join("jsonlogs");

	std::fs::create_dir_all(data_dir)
		.with_context(|| format!("creating data dir {}", data_dir.display()))?;

	// Root CA generation is RSA keygen; keep it off the runtime threads.
	let ca = {
		let certs_dir = certs_dir.clone();
		tokio::task::spawn_blocking(move || CertificateAuthority::load_or_create(&certs_dir))
			.await
			.context("CA setup task failed")??
	};
	let ca = Arc::new(ca);
	let leaf_cache = Arc::new(LeafCache::new(ca.clone(), LEAF_CACHE_CAPACITY));

	let rules = Arc::new(RuleEngine::load(rules_path));
	let registry = Arc::new(ConfigRegistry::new(global));
	let cache = Arc::new(TransformCache::new(CacheConfig {
		disk_dir: Some(cache_dir),
		..Default::default()
	}));
	let metrics = Arc::new(MetricsRegistry::new());
	let upstream = Arc::new(
		UpstreamClient::new(Duration::from_secs(settings.upstream_timeout_secs))
			.context("building upstream client")?,
	);

	let targets = TargetBrowser::parse_list(&settings.targets);

	Ok(AppState {
		settings,
		targets,
		registry,
		rules,
		cache,
		ca,
		leaf_cache,
		metrics,
		upstream,
		transformers: Arc::new(TransformerSet::new()),
		transform_pool: Arc::new(TransformPool::default()),
		jsonlog: Arc::new(JsonLogger::new(jsonlog_dir)),
	})
}

/// Start the three listeners and serve until Ctrl-C.
pub async fn run(settings: Settings, global: GlobalConfig) -> anyhow::Result<()> {
	let state = build_state(settings, global).await?;
	let settings = state.settings.clone();

	state.rules.spawn_watcher();

	let dispatcher = Arc::new(Dispatcher::new(state.clone()));

	let socks_addr: SocketAddr = format!("{}:{}", settings.bind, settings.socks_port)
		.parse()
		.context("invalid SOCKS listen address")?;
	let http_addr: SocketAddr = format!("{}:{}", settings.bind, settings.http_port)
		.parse()
		.context("invalid HTTP listen address")?;
	let portal_addr: SocketAddr = format!("{}:{}", settings.bind, settings.portal_port)
		.parse()
		.context("invalid portal listen address")?;

	let socks_listener = TcpListener::bind(socks_addr)
		.await
		.with_context(|| format!("binding SOCKS listener on {}", socks_addr))?;
	let http_listener = TcpListener::bind(http_addr)
		.await
		.with_context(|| format!("binding HTTP listener on {}", http_addr))?;
	let portal_listener = TcpListener::bind(portal_addr)
		.await
		.with_context(|| format!("binding portal listener on {}", portal_addr))?;

	tracing::info!(
		socks = %socks_addr,
		http = %http_addr,
		portal = %portal_addr,
		"revamp proxy listening"
	);

	let socks_task = tokio::spawn(proxy::serve(
		socks_listener,
		proxy::Role::Socks5,
		dispatcher.clone(),
	));
	let http_task = tokio::spawn(proxy::serve(
		http_listener,
		proxy::Role::Http,
		dispatcher.clone(),
	));

	let portal_router = control::router(state.clone());
	let portal_task = tokio::spawn(async move {
		if let Err(e) = axum::serve(
			portal_listener,
			portal_router.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.await
		{
			tracing::error!("portal server failed: {}", e);
		}
	});

	tokio::signal::ctrl_c()
		.await
		.context("waiting for shutdown signal")?;
	tracing::info!("shutting down");

	socks_task.abort();
	http_task.abort();
	portal_task.abort();
	// Short drain so in-flight responses can finish writing.
	tokio::time::sleep(Duration::from_millis(250)).await;

	Ok(())
}
