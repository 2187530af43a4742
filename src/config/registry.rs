use std::net::IpAddr;
use std::sync::RwLock;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::rules::DomainProfile;

/// Client-visible feature flags. These are the fields a client (or a domain
/// profile) may override; everything explicitly set in a higher layer wins,
/// absent fields inherit from the layer below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
	pub transform_js: bool,
	pub transform_css: bool,
	pub transform_html: bool,
	pub remove_ads: bool,
	pub remove_tracking: bool,
	pub inject_polyfills: bool,
	pub spoof_user_agent: bool,
	pub spoof_user_agent_in_js: bool,
	pub cache_enabled: bool,
}

impl Default for FeatureFlags {
	fn default() -> Self {
		Self {
			transform_js: true,
			transform_css: true,
			transform_html: true,
			remove_ads: true,
			remove_tracking: true,
			inject_polyfills: true,
			spoof_user_agent: false,
			spoof_user_agent_in_js: false,
			cache_enabled: true,
		}
	}
}

/// A partial overlay of [`FeatureFlags`]: only fields explicitly present
/// override the base. This is the wire shape of client overrides and of a
/// domain profile's `transforms` block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartialFlags {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform_js: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform_css: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transform_html: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remove_ads: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remove_tracking: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub inject_polyfills: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub spoof_user_agent: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub spoof_user_agent_in_js: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_enabled: Option<bool>,
}

impl PartialFlags {
	/// Overlay `self` onto `base`; present fields win.
	pub fn apply_to(&self, base: &mut FeatureFlags) {
		if let Some(v) = self.transform_js {
			base.transform_js = v;
		}
		if let Some(v) = self.transform_css {
			base.transform_css = v;
		}
		if let Some(v) = self.transform_html {
			base.transform_html = v;
		}
		if let Some(v) = self.remove_ads {
			base.remove_ads = v;
		}
		if let Some(v) = self.remove_tracking {
			base.remove_tracking = v;
		}
		if let Some(v) = self.inject_polyfills {
			base.inject_polyfills = v;
		}
		if let Some(v) = self.spoof_user_agent {
			base.spoof_user_agent = v;
		}
		if let Some(v) = self.spoof_user_agent_in_js {
			base.spoof_user_agent_in_js = v;
		}
		if let Some(v) = self.cache_enabled {
			base.cache_enabled = v;
		}
	}

	/// Merge another partial on top of this one (present fields of `other` win).
	pub fn merge(&mut self, other: &PartialFlags) {
		macro_rules! take {
			($field:ident) => {
				if other.$field.is_some() {
					self.$field = other.$field;
				}
			};
		}
		take!(transform_js);
		take!(transform_css);
		take!(transform_html);
		take!(remove_ads);
		take!(remove_tracking);
		take!(inject_polyfills);
		take!(spoof_user_agent);
		take!(spoof_user_agent_in_js);
		take!(cache_enabled);
	}

}

/// Process-wide defaults plus the knobs that are not client-overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
	#[serde(flatten)]
	pub flags: FeatureFlags,
	/// Hosts containing any of these substrings are ad-blocked.
	pub ad_domains: Vec<String>,
	/// URLs containing any of these substrings (case-insensitive) are
	/// tracking-blocked.
	pub tracking_patterns: Vec<String>,
	/// User-Agent presented upstream when `spoof_user_agent` is on.
	pub user_agent: String,
	pub gzip_level: u32,
	/// Bodies larger than this pass through untransformed.
	pub max_transform_bytes: usize,
	/// Mirror JSON API responses into the on-disk log tree.
	pub json_log_enabled: bool,
	/// Script URL injected by the HTML transformer when polyfills are on.
	pub polyfill_url: String,
}

impl Default for GlobalConfig {
	fn default() -> Self {
		Self {
			flags: FeatureFlags::default(),
			ad_domains: vec![
				"doubleclick.net".to_string(),
				"googlesyndication.com".to_string(),
				"adservice.google.com".to_string(),
				"amazon-adsystem.com".to_string(),
				"adnxs.com".to_string(),
				"taboola.com".to_string(),
				"outbrain.com".to_string(),
			],
			tracking_patterns: vec![
				"google-analytics.com".to_string(),
				"googletagmanager.com".to_string(),
				"/gtag/js".to_string(),
				"scorecardresearch.com".to_string(),
				"hotjar.com".to_string(),
				"mixpanel.com".to_string(),
				"segment.io".to_string(),
				"mc.yandex.ru".to_string(),
			],
			user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_11_6) AppleWebKit/601.7.7 \
			             (KHTML, like Gecko) Version/9.1.2 Safari/601.7.7"
				.to_string(),
			gzip_level: 6,
			max_transform_bytes: 8 * 1024 * 1024,
			json_log_enabled: false,
			polyfill_url: "https://polyfill-fastly.io/v3/polyfill.min.js?features=es6".to_string(),
		}
	}
}

/// Partial update for the global record; only present fields change.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfigPatch {
	#[serde(flatten)]
	pub flags: PartialFlags,
	pub ad_domains: Option<Vec<String>>,
	pub tracking_patterns: Option<Vec<String>>,
	pub user_agent: Option<String>,
	pub gzip_level: Option<u32>,
	pub max_transform_bytes: Option<usize>,
	pub json_log_enabled: Option<bool>,
	pub polyfill_url: Option<String>,
}

/// Per-request composition of the three configuration layers, plus the
/// profile-supplied custom rule material the dispatcher needs.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
	pub flags: FeatureFlags,
	pub ad_domains: Vec<String>,
	pub tracking_patterns: Vec<String>,
	pub user_agent: String,
	pub gzip_level: u32,
	pub max_transform_bytes: usize,
	pub json_log_enabled: bool,
	pub polyfill_url: String,
}

/// Owner of the layered configuration. Created by `run`, handed to
/// subsystems as an `Arc`; tests instantiate their own registry.
pub struct ConfigRegistry {
	global: RwLock<GlobalConfig>,
	clients: DashMap<IpAddr, PartialFlags>,
}

impl ConfigRegistry {
	pub fn new(global: GlobalConfig) -> Self {
		Self {
			global: RwLock::new(global),
			clients: DashMap::new(),
		}
	}

	pub fn get_global(&self) -> GlobalConfig {
		self.global.read().expect("config lock poisoned").clone()
	}

	pub fn update_partial(&self, patch: &GlobalConfigPatch) -> GlobalConfig {
		let mut global = self.global.write().expect("config lock poisoned");
		patch.flags.apply_to(&mut global.flags);
		if let Some(v) = &patch.ad_domains {
			global.ad_domains = v.clone();
		}
		if let Some(v) = &patch.tracking_patterns {
			global.tracking_patterns = v.clone();
		}
		if let Some(v) = &patch.user_agent {
			global.user_agent = v.clone();
		}
		if let Some(v) = patch.gzip_level {
			global.gzip_level = v;
		}
		if let Some(v) = patch.max_transform_bytes {
			global.max_transform_bytes = v;
		}
		if let Some(v) = patch.json_log_enabled {
			global.json_log_enabled = v;
		}
		if let Some(v) = &patch.polyfill_url {
			global.polyfill_url = v.clone();
		}
		global.clone()
	}

	pub fn reset_global(&self) {
		*self.global.write().expect("config lock poisoned") = GlobalConfig::default();
	}

	/// Client-visible flags for `ip`: the global defaults with any stored
	/// override applied.
	pub fn get_client_config(&self, ip: IpAddr) -> FeatureFlags {
		let mut flags = self.global.read().expect("config lock poisoned").flags;
		if let Some(overrides) = self.clients.get(&ip) {
			overrides.apply_to(&mut flags);
		}
		flags
	}

	/// Merge `patch` into the stored overrides for `ip`.
	pub fn merge_client_config(&self, ip: IpAddr, patch: &PartialFlags) -> FeatureFlags {
		self.clients.entry(ip).or_default().merge(patch);
		self.get_client_config(ip)
	}

	/// Remove overrides for one client, or for all clients when `ip` is None.
	pub fn reset_client(&self, ip: Option<IpAddr>) {
		match ip {
			Some(ip) => {
				self.clients.remove(&ip);
			}
			None => self.clients.clear(),
		}
	}

	/// Compose global defaults, the client overlay, and the matched domain
	/// profile into the effective per-request configuration.
	pub fn effective_for(&self, ip: IpAddr, profile: Option<&DomainProfile>) -> EffectiveConfig {
		let global = self.global.read().expect("config lock poisoned").clone();
		let mut flags = global.flags;
		if let Some(overrides) = self.clients.get(&ip) {
			overrides.apply_to(&mut flags);
		}

		let mut ad_domains = global.ad_domains;
		let mut tracking_patterns = global.tracking_patterns;

		if let Some(profile) = profile {
			if let Some(transforms) = &profile.transforms {
				transforms.apply_to(&mut flags);
			}
			if let Some(v) = profile.remove_ads {
				flags.remove_ads = v;
			}
			if let Some(v) = profile.remove_tracking {
				flags.remove_tracking = v;
			}
			if let Some(v) = profile.cache_enabled {
				flags.cache_enabled = v;
			}
			ad_domains.extend(profile.custom_ad_patterns.iter().cloned());
			tracking_patterns.extend(profile.custom_tracking_patterns.iter().cloned());
		}

		EffectiveConfig {
			flags,
			ad_domains,
			tracking_patterns,
			user_agent: global.user_agent,
			gzip_level: global.gzip_level,
			max_transform_bytes: global.max_transform_bytes,
			json_log_enabled: global.json_log_enabled,
			polyfill_url: global.polyfill_url,
		}
	}
}

impl Default for ConfigRegistry {
	fn default() -> Self {
		Self::new(GlobalConfig::default())
	}
}
