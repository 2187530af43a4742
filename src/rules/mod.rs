pub mod engine;

pub use engine::RuleEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::registry::PartialFlags;

/// How a [`DomainPattern`] is interpreted against a request host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
	/// Case-insensitive string equality.
	Exact,
	/// `*.foo.bar` matches `foo.bar` itself and every subdomain.
	Suffix,
	/// User-supplied regex, compiled case-insensitive and anchored.
	Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPattern {
	#[serde(rename = "type")]
	pub kind: PatternKind,
	pub pattern: String,
}

impl DomainPattern {
	pub fn new(kind: PatternKind, pattern: &str) -> Self {
		Self {
			kind,
			pattern: pattern.to_string(),
		}
	}
}

/// A named rule set applied when a request host matches one of its patterns.
///
/// `id` is assigned once at creation and never changes. Optional fields
/// overlay the effective configuration only when explicitly present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainProfile {
	pub id: Uuid,
	pub name: String,
	pub priority: i32,
	pub patterns: Vec<DomainPattern>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub transforms: Option<PartialFlags>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remove_ads: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub remove_tracking: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_enabled: Option<bool>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub custom_ad_patterns: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub custom_ad_selectors: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub custom_tracking_patterns: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub custom_tracking_selectors: Vec<String>,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl DomainProfile {
	pub fn new(name: String, priority: i32, patterns: Vec<DomainPattern>) -> Self {
		let now = Utc::now();
		Self {
			id: Uuid::new_v4(),
			name,
			priority,
			patterns,
			transforms: None,
			remove_ads: None,
			remove_tracking: None,
			cache_enabled: None,
			custom_ad_patterns: Vec::new(),
			custom_ad_selectors: Vec::new(),
			custom_tracking_patterns: Vec::new(),
			custom_tracking_selectors: Vec::new(),
			enabled: true,
			created_at: now,
			updated_at: now,
		}
	}
}

/// Wire payload for profile create (POST) and update (PUT). All fields are
/// optional so PUT can patch; create() enforces the required ones.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileDraft {
	pub name: Option<String>,
	pub priority: Option<i32>,
	pub patterns: Option<Vec<DomainPattern>>,
	pub transforms: Option<PartialFlags>,
	pub remove_ads: Option<bool>,
	pub remove_tracking: Option<bool>,
	pub cache_enabled: Option<bool>,
	pub custom_ad_patterns: Option<Vec<String>>,
	pub custom_ad_selectors: Option<Vec<String>>,
	pub custom_tracking_patterns: Option<Vec<String>>,
	pub custom_tracking_selectors: Option<Vec<String>>,
	pub enabled: Option<bool>,
}

/// Default rule material shipped with the store file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalRuleDefaults {
	pub ad_rules: Vec<String>,
	pub tracking_rules: Vec<String>,
	pub content_rules: Vec<String>,
}

/// The persisted shape of `data/domain-rules.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStore {
	pub version: u32,
	#[serde(default)]
	pub profiles: Vec<DomainProfile>,
	#[serde(default)]
	pub global_defaults: GlobalRuleDefaults,
}

impl Default for RuleStore {
	fn default() -> Self {
		Self {
			version: 1,
			profiles: Vec::new(),
			global_defaults: GlobalRuleDefaults::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn profile_serializes_camel_case() {
		let profile = DomainProfile::new(
			"news".to_string(),
			5,
			vec![DomainPattern::new(PatternKind::Suffix, "*.example.com")],
		);
		let json = serde_json::to_value(&profile).unwrap();
		assert_eq!(json["name"], "news");
		assert_eq!(json["patterns"][0]["type"], "suffix");
		assert!(json.get("createdAt").is_some());
		// Absent optionals are omitted, not nulled
		assert!(json.get("transforms").is_none());
	}

	#[test]
	fn store_round_trips() {
		let mut store = RuleStore::default();
		store.profiles.push(DomainProfile::new(
			"p".to_string(),
			1,
			vec![DomainPattern::new(PatternKind::Exact, "example.com")],
		));
		let json = serde_json::to_string(&store).unwrap();
		let back: RuleStore = serde_json::from_str(&json).unwrap();
		assert_eq!(back.version, 1);
		assert_eq!(back.profiles.len(), 1);
		assert_eq!(back.profiles[0].id, store.profiles[0].id);
	}
}
