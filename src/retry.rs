//! Retry with exponential backoff for fetch collaborators
//!
//! The monitor core never retries on its own: a failed fetch is terminal for
//! the notification waiting on it. Stores that talk to flaky backends wrap
//! themselves in a [`RetryingFetcher`] instead.

use crate::cache::{CacheEntity, EntityFetcher};
use crate::entities::{CollectionStatistics, Id};
use crate::error::{ErrorRecoveryConfig, MonitorError, Result};
use crate::statistics::StatisticsFetcher;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry manager that handles the retry logic with exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
	config: ErrorRecoveryConfig,
}

impl RetryManager {
	pub fn new(config: ErrorRecoveryConfig) -> Self {
		Self { config }
	}

	pub fn config(&self) -> &ErrorRecoveryConfig {
		&self.config
	}

	/// Run `operation` until it succeeds, fails with a non-retryable error or
	/// runs out of attempts
	pub async fn execute<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
	where
		F: FnMut() -> Fut + Send,
		Fut: Future<Output = Result<T>> + Send,
	{
		let mut attempt = 0;
		let start_time = tokio::time::Instant::now();

		loop {
			match operation().await {
				Ok(result) => {
					if attempt > 0 {
						debug!(
							"Operation '{}' succeeded after {} attempts in {:?}",
							operation_name,
							attempt + 1,
							start_time.elapsed()
						);
					}
					return Ok(result);
				}
				Err(error) => {
					if !error.is_retryable() {
						debug!(
							"Operation '{}' failed with non-retryable error: {}",
							operation_name, error
						);
						return Err(error);
					}

					if attempt >= self.config.max_retries {
						warn!(
							"Operation '{}' failed after {} attempts over {:?}, giving up",
							operation_name,
							attempt + 1,
							start_time.elapsed()
						);
						return Err(MonitorError::RecoveryFailed {
							operation: operation_name.to_string(),
							attempts: attempt + 1,
							last_error: error.to_string(),
						});
					}

					let delay = self.config.delay_for_attempt(attempt);
					warn!(
						"Operation '{}' failed (attempt {}), retrying in {:?}: {}",
						operation_name,
						attempt + 1,
						delay,
						error
					);

					tokio::time::sleep(delay).await;
					attempt += 1;
				}
			}
		}
	}
}

/// A builder for creating retry configurations
#[derive(Debug)]
pub struct RetryConfigBuilder {
	config: ErrorRecoveryConfig,
}

impl RetryConfigBuilder {
	pub fn new() -> Self {
		Self { config: ErrorRecoveryConfig::default() }
	}

	pub fn max_retries(mut self, max_retries: u32) -> Self {
		self.config.max_retries = max_retries;
		self
	}

	pub fn initial_delay(mut self, delay: Duration) -> Self {
		self.config.initial_retry_delay = delay;
		self
	}

	pub fn max_delay(mut self, delay: Duration) -> Self {
		self.config.max_retry_delay = delay;
		self
	}

	pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
		self.config.backoff_multiplier = multiplier;
		self
	}

	pub fn exponential_backoff(mut self, enabled: bool) -> Self {
		self.config.exponential_backoff = enabled;
		self
	}

	pub fn build(self) -> ErrorRecoveryConfig {
		self.config
	}
}

impl Default for RetryConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Wraps a fetch collaborator and retries its transient failures
#[derive(Debug)]
pub struct RetryingFetcher<F> {
	inner: F,
	retry: RetryManager,
}

impl<F> RetryingFetcher<F> {
	pub fn new(inner: F, config: ErrorRecoveryConfig) -> Self {
		Self { inner, retry: RetryManager::new(config) }
	}

	pub fn inner(&self) -> &F {
		&self.inner
	}
}

#[async_trait::async_trait]
impl<T, F> EntityFetcher<T> for RetryingFetcher<F>
where
	T: CacheEntity,
	F: EntityFetcher<T>,
{
	async fn fetch(&self, id: Id, scope: &T::Scope) -> Result<Option<T>> {
		let name = format!("fetch {:?} {}", T::KIND, id);
		self.retry.execute(&name, || self.inner.fetch(id, scope)).await
	}
}

#[async_trait::async_trait]
impl<F: StatisticsFetcher> StatisticsFetcher for RetryingFetcher<F> {
	async fn fetch_statistics(&self, collection: Id) -> Result<CollectionStatistics> {
		let name = format!("fetch statistics {}", collection);
		self.retry
			.execute(&name, || self.inner.fetch_statistics(collection))
			.await
	}
}
