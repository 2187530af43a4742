use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::OnceCell;
use tokio_rustls::rustls::server::ServerConfig;

use crate::error::{ProxyError, Result};

use super::{CertificateAuthority, LeafCert};

/// A minted host identity: the leaf material plus the rustls server config
/// presenting it.
pub struct MintedHost {
	pub leaf: LeafCert,
	pub server_config: Arc<ServerConfig>,
}

/// LRU cache of forged host certificates, bounded by hostname count.
///
/// Concurrent misses for the same host coalesce: only one signing operation
/// runs per host, later callers wait on the in-flight result. The cache
/// mutex only guards map access; signing happens outside it.
pub struct LeafCache {
	ca: Arc<CertificateAuthority>,
	certs: Mutex<LruCache<String, Arc<MintedHost>>>,
	in_flight: tokio::sync::Mutex<HashMap<String, Arc<OnceCell<Arc<MintedHost>>>>>,
}

impl LeafCache {
	pub fn new(ca: Arc<CertificateAuthority>, capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
		Self {
			ca,
			certs: Mutex::new(LruCache::new(capacity)),
			in_flight: tokio::sync::Mutex::new(HashMap::new()),
		}
	}

	/// Return the minted identity for `host`, signing one on a miss.
	pub async fn cert_for(&self, host: &str) -> Result<Arc<MintedHost>> {
		if let Some(hit) = self.certs.lock().expect("leaf cache poisoned").get(host) {
			return Ok(hit.clone());
		}

		let cell = {
			let mut in_flight = self.in_flight.lock().await;
			in_flight
				.entry(host.to_string())
				.or_insert_with(|| Arc::new(OnceCell::new()))
				.clone()
		};

		let result = cell
			.get_or_try_init(|| async {
				let ca = self.ca.clone();
				let host_owned = host.to_string();
				let minted = tokio::task::spawn_blocking(move || -> Result<MintedHost> {
					let leaf = ca.mint_leaf(&host_owned)?;
					let server_config = ca.server_config_for(&leaf)?;
					Ok(MintedHost { leaf, server_config })
				})
				.await
				.map_err(|e| ProxyError::Tls(format!("leaf signing task failed: {}", e)))??;

				let minted = Arc::new(minted);
				self.certs
					.lock()
					.expect("leaf cache poisoned")
					.put(host.to_string(), minted.clone());
				Ok(minted)
			})
			.await
			.cloned();

		self.in_flight.lock().await.remove(host);
		result
	}

	/// Drop every cached leaf. The CA itself is unaffected; certificates
	/// are re-minted on demand.
	pub fn clear(&self) {
		self.certs.lock().expect("leaf cache poisoned").clear();
	}

	pub fn len(&self) -> usize {
		self.certs.lock().expect("leaf cache poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn cache() -> (tempfile::TempDir, Arc<LeafCache>) {
		let dir = tempfile::tempdir().unwrap();
		let ca = Arc::new(
			tokio::task::spawn_blocking({
				let path = dir.path().to_path_buf();
				move || CertificateAuthority::load_or_create(&path).unwrap()
			})
			.await
			.unwrap(),
		);
		let cache = Arc::new(LeafCache::new(ca, 8));
		(dir, cache)
	}

	#[tokio::test]
	async fn cert_for_is_cached_per_host() {
		let (_dir, cache) = cache().await;
		let a = cache.cert_for("example.com").await.unwrap();
		let b = cache.cert_for("example.com").await.unwrap();
		// Same Arc, not merely equal content: the second call was a cache hit.
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn concurrent_misses_coalesce_to_one_signing() {
		let (_dir, cache) = cache().await;
		let (a, b) = tokio::join!(
			cache.cert_for("coalesce.example"),
			cache.cert_for("coalesce.example")
		);
		let (a, b) = (a.unwrap(), b.unwrap());
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn clear_empties_leaves_only() {
		let (_dir, cache) = cache().await;
		cache.cert_for("example.com").await.unwrap();
		assert_eq!(cache.len(), 1);
		cache.clear();
		assert!(cache.is_empty());
		// Re-minting still works afterwards.
		cache.cert_for("example.com").await.unwrap();
		assert_eq!(cache.len(), 1);
	}

	#[tokio::test]
	async fn eviction_is_bounded_by_capacity() {
		let dir = tempfile::tempdir().unwrap();
		let ca = Arc::new(
			tokio::task::spawn_blocking({
				let path = dir.path().to_path_buf();
				move || CertificateAuthority::load_or_create(&path).unwrap()
			})
			.await
			.unwrap(),
		);
		let cache = LeafCache::new(ca, 2);
		cache.cert_for("a.example").await.unwrap();
		cache.cert_for("b.example").await.unwrap();
		cache.cert_for("c.example").await.unwrap();
		assert_eq!(cache.len(), 2);
	}
}
