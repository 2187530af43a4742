use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use uuid::Uuid;

use crate::error::{ProxyError, Result};

use super::{DomainPattern, DomainProfile, PatternKind, ProfileDraft, RuleStore};

/// A pattern compiled once at insert/load time. Invalid regex is rejected
/// before it ever reaches the match path, so matching itself cannot fail.
#[derive(Debug, Clone)]
enum CompiledPattern {
	Exact(String),
	Matcher(Regex),
}

impl CompiledPattern {
	fn matches(&self, host: &str) -> bool {
		match self {
			CompiledPattern::Exact(s) => s == &host.to_ascii_lowercase(),
			CompiledPattern::Matcher(re) => re.is_match(host),
		}
	}
}

pub fn compile_pattern(pattern: &DomainPattern) -> Result<CompiledPatternHandle> {
	let compiled = match pattern.kind {
		PatternKind::Exact => CompiledPattern::Exact(pattern.pattern.to_ascii_lowercase()),
		PatternKind::Suffix => {
			// `*.foo.bar` matches the bare parent and every subdomain.
			let source = if let Some(rest) = pattern.pattern.strip_prefix("*.") {
				format!("^(?:.*\\.)?{}$", escape_glob(rest))
			} else {
				format!("^{}$", escape_glob(&pattern.pattern))
			};
			let re = RegexBuilder::new(&source)
				.case_insensitive(true)
				.build()
				.map_err(|e| {
					ProxyError::Validation(format!(
						"suffix pattern {:?} did not compile: {}",
						pattern.pattern, e
					))
				})?;
			CompiledPattern::Matcher(re)
		}
		PatternKind::Regex => {
			let source = anchor(&pattern.pattern);
			let re = RegexBuilder::new(&source)
				.case_insensitive(true)
				.build()
				.map_err(|e| {
					ProxyError::Validation(format!("invalid regex {:?}: {}", pattern.pattern, e))
				})?;
			CompiledPattern::Matcher(re)
		}
	};
	Ok(CompiledPatternHandle(compiled))
}

/// Opaque handle so callers can pre-validate patterns without seeing the
/// internal representation.
#[derive(Debug, Clone)]
pub struct CompiledPatternHandle(CompiledPattern);

fn escape_glob(s: &str) -> String {
	let mut out = String::with_capacity(s.len() + 8);
	for ch in s.chars() {
		match ch {
			'*' => out.push_str(".*"),
			ch if regex_syntax_char(ch) => {
				out.push('\\');
				out.push(ch);
			}
			ch => out.push(ch),
		}
	}
	out
}

fn regex_syntax_char(ch: char) -> bool {
	matches!(
		ch,
		'.' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\'
	)
}

fn anchor(pattern: &str) -> String {
	let mut source = String::new();
	if !pattern.starts_with('^') {
		source.push('^');
	}
	source.push_str(pattern);
	if !pattern.ends_with('$') {
		source.push('$');
	}
	source
}

struct CompiledProfile {
	profile: DomainProfile,
	patterns: Vec<(DomainPattern, CompiledPattern)>,
}

/// Immutable compiled view of the store. Swapped wholesale on every
/// mutation or reload so match paths never hold the write lock.
struct CompiledStore {
	store: RuleStore,
	/// Enabled profiles, sorted by (priority desc, created_at asc, id asc).
	/// The sort is total, so matching is stable for a given store.
	ordered: Vec<CompiledProfile>,
}

impl CompiledStore {
	fn build(store: RuleStore) -> Result<Self> {
		let mut ordered = Vec::with_capacity(store.profiles.len());
		for profile in &store.profiles {
			let mut patterns = Vec::with_capacity(profile.patterns.len());
			for p in &profile.patterns {
				let CompiledPatternHandle(compiled) = compile_pattern(p)?;
				patterns.push((p.clone(), compiled));
			}
			ordered.push(CompiledProfile {
				profile: profile.clone(),
				patterns,
			});
		}
		ordered.sort_by(|a, b| {
			b.profile
				.priority
				.cmp(&a.profile.priority)
				.then(a.profile.created_at.cmp(&b.profile.created_at))
				.then(a.profile.id.cmp(&b.profile.id))
		});
		Ok(Self { store, ordered })
	}

	/// Build while dropping profiles whose patterns no longer compile.
	/// Used on reload: an externally edited file must never take the
	/// engine down, and an invalid pattern must simply never match.
	fn build_lenient(store: RuleStore) -> Self {
		let mut pruned = store.clone();
		pruned.profiles.retain(|profile| {
			let ok = profile.patterns.iter().all(|p| compile_pattern(p).is_ok());
			if !ok {
				tracing::warn!(
					profile = %profile.name,
					"dropping profile with uncompilable pattern on reload"
				);
			}
			ok
		});
		Self::build(pruned).expect("pruned store compiles")
	}
}

/// The domain rule engine: pattern compilation, priority-ordered matching
/// with a per-host cache, CRUD with validation, atomic persistence, and
/// hot reload when the rules file changes on disk.
pub struct RuleEngine {
	path: PathBuf,
	compiled: RwLock<Arc<CompiledStore>>,
	match_cache: DashMap<String, Option<(Uuid, usize)>>,
}

impl RuleEngine {
	/// Load `domain-rules.json` from `path`. A missing file yields the
	/// default store; invalid JSON or a missing `version` yields an empty
	/// store and a warning, never an error.
	pub fn load(path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		let store = read_store_lenient(&path);
		let compiled = Arc::new(CompiledStore::build_lenient(store));
		Self {
			path,
			compiled: RwLock::new(compiled),
			match_cache: DashMap::new(),
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn snapshot(&self) -> Arc<CompiledStore> {
		self.compiled.read().expect("rule store lock poisoned").clone()
	}

	fn install(&self, compiled: CompiledStore) {
		*self.compiled.write().expect("rule store lock poisoned") = Arc::new(compiled);
		self.match_cache.clear();
	}

	/// Return the first enabled profile (highest priority) with a pattern
	/// matching `host`, along with the pattern that matched.
	pub fn match_for_domain(&self, host: &str) -> Option<(DomainProfile, DomainPattern)> {
		let key = host.to_ascii_lowercase();
		let snapshot = self.snapshot();

		if let Some(cached) = self.match_cache.get(&key) {
			return cached.as_ref().and_then(|(profile_id, pattern_idx)| {
				let entry = snapshot
					.ordered
					.iter()
					.find(|c| c.profile.id == *profile_id)?;
				let (pattern, _) = entry.patterns.get(*pattern_idx)?;
				Some((entry.profile.clone(), pattern.clone()))
			});
		}

		let mut found: Option<(Uuid, usize)> = None;
		'outer: for candidate in &snapshot.ordered {
			if !candidate.profile.enabled {
				continue;
			}
			for (idx, (_, compiled)) in candidate.patterns.iter().enumerate() {
				if compiled.matches(&key) {
					found = Some((candidate.profile.id, idx));
					break 'outer;
				}
			}
		}

		self.match_cache.insert(key, found);
		found.and_then(|(profile_id, pattern_idx)| {
			let entry = snapshot.ordered.iter().find(|c| c.profile.id == profile_id)?;
			let (pattern, _) = entry.patterns.get(pattern_idx)?;
			Some((entry.profile.clone(), pattern.clone()))
		})
	}

	pub fn list(&self) -> Vec<DomainProfile> {
		self.snapshot().store.profiles.clone()
	}

	pub fn get(&self, id: Uuid) -> Option<DomainProfile> {
		self.snapshot()
			.store
			.profiles
			.iter()
			.find(|p| p.id == id)
			.cloned()
	}

	/// Create a profile from a draft. Requires a non-empty name and at
	/// least one pattern; every pattern must compile.
	pub fn create(&self, draft: ProfileDraft) -> Result<DomainProfile> {
		let name = draft
			.name
			.as_deref()
			.map(str::trim)
			.filter(|n| !n.is_empty())
			.ok_or_else(|| ProxyError::Validation("profile name must not be empty".into()))?
			.to_string();
		let patterns = draft
			.patterns
			.clone()
			.filter(|p| !p.is_empty())
			.ok_or_else(|| ProxyError::Validation("profile needs at least one pattern".into()))?;
		for pattern in &patterns {
			compile_pattern(pattern)?;
		}

		let mut profile = DomainProfile::new(name, draft.priority.unwrap_or(0), patterns);
		apply_draft_optionals(&mut profile, &draft);

		let mut store = self.snapshot().store.clone();
		store.profiles.push(profile.clone());
		self.commit(store)?;
		Ok(profile)
	}

	/// Patch an existing profile. Supplied fields are validated exactly as
	/// on create; absent fields are left alone. `id` and `created_at`
	/// never change.
	pub fn update(&self, id: Uuid, draft: ProfileDraft) -> Result<DomainProfile> {
		if let Some(name) = &draft.name {
			if name.trim().is_empty() {
				return Err(ProxyError::Validation("profile name must not be empty".into()));
			}
		}
		if let Some(patterns) = &draft.patterns {
			if patterns.is_empty() {
				return Err(ProxyError::Validation("profile needs at least one pattern".into()));
			}
			for pattern in patterns {
				compile_pattern(pattern)?;
			}
		}

		let mut store = self.snapshot().store.clone();
		let profile = store
			.profiles
			.iter_mut()
			.find(|p| p.id == id)
			.ok_or_else(|| ProxyError::NotFound(format!("profile {}", id)))?;

		if let Some(name) = &draft.name {
			profile.name = name.trim().to_string();
		}
		if let Some(priority) = draft.priority {
			profile.priority = priority;
		}
		if let Some(patterns) = &draft.patterns {
			profile.patterns = patterns.clone();
		}
		apply_draft_optionals(profile, &draft);
		profile.updated_at = chrono::Utc::now();
		let updated = profile.clone();

		self.commit(store)?;
		Ok(updated)
	}

	pub fn delete(&self, id: Uuid) -> Result<()> {
		let mut store = self.snapshot().store.clone();
		let before = store.profiles.len();
		store.profiles.retain(|p| p.id != id);
		if store.profiles.len() == before {
			return Err(ProxyError::NotFound(format!("profile {}", id)));
		}
		self.commit(store)?;
		Ok(())
	}

	/// Compile, swap, and persist a mutated store. Compilation happens
	/// before persistence so an invalid pattern never reaches disk.
	fn commit(&self, mut store: RuleStore) -> Result<()> {
		store.version = store.version.saturating_add(1);
		let compiled = CompiledStore::build(store)?;
		persist_atomic(&self.path, &compiled.store)?;
		self.install(compiled);
		Ok(())
	}

	/// Re-read the rules file and swap in the fresh store. The per-domain
	/// match cache is invalidated.
	pub fn reload(&self) {
		let store = read_store_lenient(&self.path);
		self.install(CompiledStore::build_lenient(store));
		tracing::info!(path = %self.path.display(), "domain rules reloaded");
	}

	/// Watch the rules file for external modification; every change event
	/// triggers a reload. Runs until the process exits.
	pub fn spawn_watcher(self: &Arc<Self>) {
		use notify::{Event, RecursiveMode, Watcher};

		let engine = Arc::clone(self);
		let path = self.path.clone();
		let dir = path
			.parent()
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."));

		let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
		let file_name = path.file_name().map(|n| n.to_os_string());

		std::thread::spawn(move || {
			let watch_target = file_name.clone();
			let mut watcher =
				match notify::recommended_watcher(move |res: notify::Result<Event>| {
					if let Ok(event) = res {
						let relevant = event.paths.iter().any(|p| {
							p.file_name().map(|n| n.to_os_string()) == watch_target
						});
						if relevant {
							let _ = tx.send(());
						}
					}
				}) {
					Ok(w) => w,
					Err(e) => {
						tracing::warn!("rules watcher unavailable: {}", e);
						return;
					}
				};

			if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
				tracing::warn!(dir = %dir.display(), "cannot watch rules dir: {}", e);
				return;
			}
			// Keep the watcher alive for the lifetime of the process.
			std::thread::park();
		});

		tokio::spawn(async move {
			while rx.recv().await.is_some() {
				// Coalesce bursts of events from a single editor save.
				tokio::time::sleep(std::time::Duration::from_millis(100)).await;
				while rx.try_recv().is_ok() {}
				engine.reload();
			}
		});
	}
}

fn apply_draft_optionals(profile: &mut DomainProfile, draft: &ProfileDraft) {
	if draft.transforms.is_some() {
		profile.transforms = draft.transforms;
	}
	if draft.remove_ads.is_some() {
		profile.remove_ads = draft.remove_ads;
	}
	if draft.remove_tracking.is_some() {
		profile.remove_tracking = draft.remove_tracking;
	}
	if draft.cache_enabled.is_some() {
		profile.cache_enabled = draft.cache_enabled;
	}
	if let Some(v) = &draft.custom_ad_patterns {
		profile.custom_ad_patterns = v.clone();
	}
	if let Some(v) = &draft.custom_ad_selectors {
		profile.custom_ad_selectors = v.clone();
	}
	if let Some(v) = &draft.custom_tracking_patterns {
		profile.custom_tracking_patterns = v.clone();
	}
	if let Some(v) = &draft.custom_tracking_selectors {
		profile.custom_tracking_selectors = v.clone();
	}
	if let Some(v) = draft.enabled {
		profile.enabled = v;
	}
}

/// Read the store without ever failing: a missing file yields defaults,
/// malformed JSON or a missing `version` yields an empty store plus a
/// warning.
fn read_store_lenient(path: &Path) -> RuleStore {
	let raw = match std::fs::read_to_string(path) {
		Ok(raw) => raw,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return RuleStore::default(),
		Err(e) => {
			tracing::warn!(path = %path.display(), "cannot read rules file: {}", e);
			return RuleStore::default();
		}
	};

	let value: serde_json::Value = match serde_json::from_str(&raw) {
		Ok(v) => v,
		Err(e) => {
			tracing::warn!(path = %path.display(), "rules file is not valid JSON, using empty store: {}", e);
			return RuleStore::default();
		}
	};
	if value.get("version").and_then(|v| v.as_u64()).is_none() {
		tracing::warn!(path = %path.display(), "rules file missing version, using empty store");
		return RuleStore::default();
	}
	match serde_json::from_value(value) {
		Ok(store) => store,
		Err(e) => {
			tracing::warn!(path = %path.display(), "rules file has unexpected shape, using empty store: {}", e);
			RuleStore::default()
		}
	}
}

/// Write-to-temp-then-rename so a crash mid-write never leaves a torn
/// rules file behind.
fn persist_atomic(path: &Path, store: &RuleStore) -> Result<()> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	std::fs::create_dir_all(parent)?;

	let tmp = parent.join(format!(
		".{}.tmp.{}",
		path.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_else(|| "domain-rules.json".to_string()),
		std::process::id()
	));

	let body = serde_json::to_vec_pretty(store)
		.map_err(|e| ProxyError::Validation(format!("store not serializable: {}", e)))?;
	std::fs::write(&tmp, &body)?;
	if let Err(e) = std::fs::rename(&tmp, path) {
		let _ = std::fs::remove_file(&tmp);
		return Err(e.into());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::registry::PartialFlags;

	fn engine_in(dir: &tempfile::TempDir) -> RuleEngine {
		RuleEngine::load(dir.path().join("domain-rules.json"))
	}

	fn draft(name: &str, priority: i32, patterns: Vec<DomainPattern>) -> ProfileDraft {
		ProfileDraft {
			name: Some(name.to_string()),
			priority: Some(priority),
			patterns: Some(patterns),
			..Default::default()
		}
	}

	#[test]
	fn suffix_matches_parent_and_subdomains() {
		let handle =
			compile_pattern(&DomainPattern::new(PatternKind::Suffix, "*.example.com")).unwrap();
		let CompiledPatternHandle(compiled) = handle;
		assert!(compiled.matches("example.com"));
		assert!(compiled.matches("www.example.com"));
		assert!(compiled.matches("a.b.example.com"));
		assert!(compiled.matches("WWW.EXAMPLE.COM"));
		assert!(!compiled.matches("example.org"));
		assert!(!compiled.matches("notexample.com"));
	}

	#[test]
	fn exact_is_case_insensitive() {
		let CompiledPatternHandle(compiled) =
			compile_pattern(&DomainPattern::new(PatternKind::Exact, "Example.COM")).unwrap();
		assert!(compiled.matches("example.com"));
		assert!(!compiled.matches("www.example.com"));
	}

	#[test]
	fn regex_is_anchored_and_case_insensitive() {
		let CompiledPatternHandle(compiled) =
			compile_pattern(&DomainPattern::new(PatternKind::Regex, r"cdn\d+\.example\.com"))
				.unwrap();
		assert!(compiled.matches("cdn1.example.com"));
		assert!(compiled.matches("CDN42.EXAMPLE.COM"));
		// Anchoring: no substring match
		assert!(!compiled.matches("xcdn1.example.com.evil.net"));
	}

	#[test]
	fn invalid_regex_is_rejected_at_insert() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		let err = engine
			.create(draft(
				"bad",
				0,
				vec![DomainPattern::new(PatternKind::Regex, "([unclosed")],
			))
			.unwrap_err();
		assert!(matches!(err, ProxyError::Validation(_)));
		assert!(engine.list().is_empty());
	}

	#[test]
	fn highest_priority_profile_wins() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);

		let mut p1 = draft(
			"P1",
			10,
			vec![DomainPattern::new(PatternKind::Suffix, "*.example.com")],
		);
		p1.transforms = Some(PartialFlags {
			transform_js: Some(false),
			..Default::default()
		});
		let mut p2 = draft(
			"P2",
			1,
			vec![DomainPattern::new(PatternKind::Exact, "example.com")],
		);
		p2.transforms = Some(PartialFlags {
			transform_js: Some(true),
			..Default::default()
		});
		engine.create(p1).unwrap();
		engine.create(p2).unwrap();

		let (profile, _) = engine.match_for_domain("www.example.com").unwrap();
		assert_eq!(profile.name, "P1");

		// Both match the bare parent; P1 wins on priority.
		let (profile, pattern) = engine.match_for_domain("example.com").unwrap();
		assert_eq!(profile.name, "P1");
		assert_eq!(pattern.kind, PatternKind::Suffix);
	}

	#[test]
	fn disabled_profiles_never_match() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		let mut d = draft(
			"off",
			10,
			vec![DomainPattern::new(PatternKind::Exact, "example.com")],
		);
		d.enabled = Some(false);
		engine.create(d).unwrap();
		assert!(engine.match_for_domain("example.com").is_none());
	}

	#[test]
	fn match_is_none_without_candidates() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		assert!(engine.match_for_domain("example.com").is_none());
	}

	#[test]
	fn crud_persists_and_survives_reload() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		let created = engine
			.create(draft(
				"keep",
				3,
				vec![DomainPattern::new(PatternKind::Exact, "example.com")],
			))
			.unwrap();

		// A second engine reading the same file sees the profile.
		let engine2 = engine_in(&dir);
		let listed = engine2.list();
		assert_eq!(listed.len(), 1);
		assert_eq!(listed[0].id, created.id);

		engine.delete(created.id).unwrap();
		let engine3 = engine_in(&dir);
		assert!(engine3.list().is_empty());
	}

	#[test]
	fn update_rejects_unknown_id() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		let err = engine
			.update(Uuid::new_v4(), ProfileDraft::default())
			.unwrap_err();
		assert!(matches!(err, ProxyError::NotFound(_)));
	}

	#[test]
	fn update_patches_fields_and_bumps_updated_at() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		let created = engine
			.create(draft(
				"before",
				0,
				vec![DomainPattern::new(PatternKind::Exact, "example.com")],
			))
			.unwrap();

		let patched = engine
			.update(
				created.id,
				ProfileDraft {
					name: Some("after".to_string()),
					priority: Some(7),
					..Default::default()
				},
			)
			.unwrap();
		assert_eq!(patched.name, "after");
		assert_eq!(patched.priority, 7);
		assert_eq!(patched.created_at, created.created_at);
		assert!(patched.updated_at >= created.updated_at);
		// Patterns untouched
		assert_eq!(patched.patterns, created.patterns);
	}

	#[test]
	fn malformed_file_loads_as_empty_store() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("domain-rules.json");
		std::fs::write(&path, "{ not json").unwrap();
		let engine = RuleEngine::load(&path);
		assert!(engine.list().is_empty());

		std::fs::write(&path, r#"{"profiles": []}"#).unwrap();
		let engine = RuleEngine::load(&path);
		assert!(engine.list().is_empty());
	}

	#[test]
	fn external_edit_plus_reload_invalidates_match_cache() {
		let dir = tempfile::tempdir().unwrap();
		let engine = engine_in(&dir);
		engine
			.create(draft(
				"first",
				1,
				vec![DomainPattern::new(PatternKind::Exact, "example.com")],
			))
			.unwrap();
		// Prime the match cache
		assert!(engine.match_for_domain("example.com").is_some());

		// Simulate an external edit emptying the store
		let mut store = RuleStore::default();
		store.version = 99;
		std::fs::write(
			engine.path(),
			serde_json::to_string(&store).unwrap(),
		)
		.unwrap();
		engine.reload();
		assert!(engine.match_for_domain("example.com").is_none());
	}
}
