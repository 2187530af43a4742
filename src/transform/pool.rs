use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cache::CachedArtifact;
use crate::error::{ProxyError, Result};

/// Bounded work queue for CPU-heavy transform jobs.
///
/// Transforms are synchronous CPU work; running them inline would stall
/// the connection tasks sharing the runtime. Jobs run on the blocking
/// thread pool behind a semaphore capped at the CPU count, with a
/// per-task deadline. A timed-out or panicked job surfaces as a
/// transform failure, which the pipeline recovers from by serving the
/// original bytes.
pub struct TransformPool {
	permits: Arc<Semaphore>,
	task_timeout: Duration,
}

impl TransformPool {
	pub fn new(task_timeout: Duration) -> Self {
		let cap = std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(2);
		Self {
			permits: Arc::new(Semaphore::new(cap)),
			task_timeout,
		}
	}

	/// Run one transform job to completion or deadline.
	pub async fn run<F>(&self, job: F) -> Result<CachedArtifact>
	where
		F: FnOnce() -> Result<CachedArtifact> + Send + 'static,
	{
		let permit = self
			.permits
			.clone()
			.acquire_owned()
			.await
			.map_err(|_| ProxyError::Transform("transform pool is closed".into()))?;

		let handle = tokio::task::spawn_blocking(move || {
			let _permit = permit;
			job()
		});

		match tokio::time::timeout(self.task_timeout, handle).await {
			Ok(Ok(result)) => result,
			Ok(Err(join_err)) => Err(ProxyError::Transform(format!(
				"transform task failed: {}",
				join_err
			))),
			Err(_) => Err(ProxyError::Transform(format!(
				"transform exceeded {:?}",
				self.task_timeout
			))),
		}
	}
}

impl Default for TransformPool {
	fn default() -> Self {
		Self::new(Duration::from_secs(10))
	}
}
