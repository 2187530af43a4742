use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::transform::ContentKind;

/// Cache key: the fetched URL plus the content kind it was transformed as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
	pub url: String,
	pub kind: ContentKind,
}

impl CacheKey {
	pub fn new(url: impl Into<String>, kind: ContentKind) -> Self {
		Self {
			url: url.into(),
			kind,
		}
	}

	/// Content-addressed file name for the disk mirror.
	fn file_stem(&self) -> String {
		let mut hasher = Sha256::new();
		hasher.update(self.url.as_bytes());
		hasher.update(b"|");
		hasher.update(self.kind.as_str().as_bytes());
		let digest = hasher.finalize();
		digest.iter().map(|b| format!("{:02x}", b)).collect()
	}
}

/// A stored transform result.
#[derive(Debug, Clone)]
pub struct CachedArtifact {
	pub body: Bytes,
	pub content_type: Option<String>,
	created_at: Instant,
}

impl CachedArtifact {
	pub fn new(body: Bytes, content_type: Option<String>) -> Self {
		Self {
			body,
			content_type,
			created_at: Instant::now(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
	pub max_entries: usize,
	pub max_bytes: usize,
	pub ttl: Duration,
	/// Best-effort disk mirror; `None` keeps the cache memory-only.
	pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			max_entries: 2048,
			max_bytes: 256 * 1024 * 1024,
			ttl: Duration::from_secs(30 * 60),
			disk_dir: None,
		}
	}
}

struct Store {
	entries: LruCache<CacheKey, Arc<CachedArtifact>>,
	total_bytes: usize,
}

/// Content-addressed transform cache with a single-flight discipline per
/// key and a redirect tombstone set.
///
/// Eviction is LRU by entry count and total bytes, plus a TTL shared with
/// the tombstones. Evicted entries are only unlinked from the map;
/// in-flight readers hold `Bytes` clones, so eviction never invalidates a
/// response being written.
pub struct TransformCache {
	config: CacheConfig,
	store: Mutex<Store>,
	in_flight: tokio::sync::Mutex<HashMap<CacheKey, Arc<OnceCell<Arc<CachedArtifact>>>>>,
	tombstones: DashMap<String, Instant>,
}

impl TransformCache {
	pub fn new(config: CacheConfig) -> Self {
		if let Some(dir) = &config.disk_dir {
			if let Err(e) = std::fs::create_dir_all(dir) {
				tracing::warn!(dir = %dir.display(), "cannot create cache dir: {}", e);
			}
		}
		let entries = LruCache::new(
			NonZeroUsize::new(config.max_entries.max(1)).expect("non-zero capacity"),
		);
		Self {
			config,
			store: Mutex::new(Store {
				entries,
				total_bytes: 0,
			}),
			in_flight: tokio::sync::Mutex::new(HashMap::new()),
			tombstones: DashMap::new(),
		}
	}

	/// Look up a stored artifact. Tombstoned URLs and expired entries miss.
	pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedArtifact>> {
		if self.is_redirect(&key.url) {
			return None;
		}

		{
			let mut store = self.store.lock().expect("cache lock poisoned");
			if let Some(hit) = store.entries.get(key) {
				if hit.created_at.elapsed() <= self.config.ttl {
					return Some(hit.clone());
				}
				let stale = store.entries.pop(key);
				if let Some(stale) = stale {
					store.total_bytes = store.total_bytes.saturating_sub(stale.body.len());
				}
			}
		}

		self.read_disk(key).map(|artifact| {
			let artifact = Arc::new(artifact);
			self.insert(key.clone(), artifact.clone());
			artifact
		})
	}

	/// Store an artifact unless its URL is tombstoned.
	pub fn put(&self, key: CacheKey, artifact: CachedArtifact) -> Arc<CachedArtifact> {
		let artifact = Arc::new(artifact);
		if self.is_redirect(&key.url) {
			return artifact;
		}
		self.write_disk(&key, &artifact);
		self.insert(key, artifact.clone());
		artifact
	}

	fn insert(&self, key: CacheKey, artifact: Arc<CachedArtifact>) {
		let mut store = self.store.lock().expect("cache lock poisoned");
		if let Some(old) = store.entries.put(key, artifact.clone()) {
			store.total_bytes = store.total_bytes.saturating_sub(old.body.len());
		}
		store.total_bytes += artifact.body.len();

		while store.total_bytes > self.config.max_bytes {
			match store.entries.pop_lru() {
				Some((_, evicted)) => {
					store.total_bytes = store.total_bytes.saturating_sub(evicted.body.len());
				}
				None => break,
			}
		}
	}

	/// Run `producer` at most once per key among concurrent callers; every
	/// caller gets the produced (and stored) artifact. The boolean is true
	/// for the caller whose invocation actually ran the producer.
	pub async fn do_cached<F, Fut>(
		&self,
		key: CacheKey,
		producer: F,
	) -> Result<(Arc<CachedArtifact>, bool)>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<CachedArtifact>>,
	{
		if let Some(hit) = self.get(&key) {
			return Ok((hit, false));
		}

		let cell = {
			let mut in_flight = self.in_flight.lock().await;
			in_flight
				.entry(key.clone())
				.or_insert_with(|| Arc::new(OnceCell::new()))
				.clone()
		};

		let ran = AtomicBool::new(false);
		let result = cell
			.get_or_try_init(|| {
				ran.store(true, Ordering::Release);
				let key = key.clone();
				async {
					// The producer result is stored before any waiter
					// observes it.
					let artifact = producer().await?;
					Ok(self.put(key, artifact))
				}
			})
			.await
			.cloned();

		self.in_flight.lock().await.remove(&key);
		result.map(|artifact| (artifact, ran.load(Ordering::Acquire)))
	}

	/// Record a URL observed returning a redirect; any stored entries for
	/// it are removed so the tombstone invariant holds.
	pub fn mark_redirect(&self, url: &str) {
		self.tombstones.insert(url.to_string(), Instant::now());
		let mut store = self.store.lock().expect("cache lock poisoned");
		for kind in [
			ContentKind::Js,
			ContentKind::Css,
			ContentKind::Html,
			ContentKind::Image,
			ContentKind::Other,
		] {
			if let Some(evicted) = store.entries.pop(&CacheKey::new(url, kind)) {
				store.total_bytes = store.total_bytes.saturating_sub(evicted.body.len());
			}
		}
	}

	pub fn is_redirect(&self, url: &str) -> bool {
		// The read guard must drop before the expired-entry removal below.
		let fresh = match self.tombstones.get(url) {
			Some(entry) => entry.elapsed() <= self.config.ttl,
			None => return false,
		};
		if !fresh {
			self.tombstones.remove(url);
		}
		fresh
	}

	pub fn entry_count(&self) -> usize {
		self.store.lock().expect("cache lock poisoned").entries.len()
	}

	pub fn total_bytes(&self) -> usize {
		self.store.lock().expect("cache lock poisoned").total_bytes
	}

	fn disk_paths(&self, key: &CacheKey) -> Option<(PathBuf, PathBuf)> {
		let dir = self.config.disk_dir.as_ref()?;
		let stem = key.file_stem();
		Some((dir.join(&stem), dir.join(format!("{}.meta", stem))))
	}

	fn read_disk(&self, key: &CacheKey) -> Option<CachedArtifact> {
		let (body_path, meta_path) = self.disk_paths(key)?;
		let modified = std::fs::metadata(&body_path).ok()?.modified().ok()?;
		if modified.elapsed().map(|age| age > self.config.ttl).unwrap_or(true) {
			return None;
		}
		let body = std::fs::read(&body_path).ok()?;
		let content_type = std::fs::read_to_string(&meta_path)
			.ok()
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty());
		Some(CachedArtifact::new(Bytes::from(body), content_type))
	}

	fn write_disk(&self, key: &CacheKey, artifact: &Arc<CachedArtifact>) {
		let Some((body_path, meta_path)) = self.disk_paths(key) else {
			return;
		};
		let artifact = artifact.clone();
		tokio::task::spawn_blocking(move || {
			if let Err(e) = std::fs::write(&body_path, &artifact.body) {
				tracing::warn!(path = %body_path.display(), "cache mirror write failed: {}", e);
				return;
			}
			let meta = artifact.content_type.clone().unwrap_or_default();
			if let Err(e) = std::fs::write(&meta_path, meta) {
				tracing::warn!(path = %meta_path.display(), "cache meta write failed: {}", e);
			}
		});
	}
}
