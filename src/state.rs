use std::sync::Arc;

use crate::ca::{CertificateAuthority, LeafCache};
use crate::cache::TransformCache;
use crate::config::registry::ConfigRegistry;
use crate::config::{Settings, TargetBrowser};
use crate::jsonlog::JsonLogger;
use crate::observability::MetricsRegistry;
use crate::rules::RuleEngine;
use crate::transform::{TransformPool, TransformerSet};
use crate::upstream::UpstreamClient;

/// Shared handles owned by `run` and borrowed by every subsystem.
///
/// Tests build their own `AppState` against temp directories; nothing in
/// here is process-global.
#[derive(Clone)]
pub struct AppState {
	pub settings: Settings,
	pub targets: Vec<TargetBrowser>,
	pub registry: Arc<ConfigRegistry>,
	pub rules: Arc<RuleEngine>,
	pub cache: Arc<TransformCache>,
	pub ca: Arc<CertificateAuthority>,
	pub leaf_cache: Arc<LeafCache>,
	pub metrics: Arc<MetricsRegistry>,
	pub upstream: Arc<UpstreamClient>,
	pub transformers: Arc<TransformerSet>,
	pub transform_pool: Arc<TransformPool>,
	pub jsonlog: Arc<JsonLogger>,
}
