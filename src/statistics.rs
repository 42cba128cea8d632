//! Coalescing of collection statistics refreshes

use crate::entities::{CollectionStatistics, Id};
use crate::error::Result;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Fetches up to date statistics for a collection
#[async_trait::async_trait]
pub trait StatisticsFetcher: Send + Sync {
	async fn fetch_statistics(&self, collection: Id) -> Result<CollectionStatistics>;
}

/// Outcome of a statistics fetch, sent back to the controlling task
#[derive(Debug)]
pub struct StatisticsCompletion {
	pub collection: Id,
	pub result: Result<CollectionStatistics>,
}

/// A one-shot deadline polled by the owning event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTask {
	deadline: Instant,
}

impl ScheduledTask {
	pub fn after(delay: Duration) -> Self {
		Self { deadline: Instant::now() + delay }
	}

	pub fn deadline(&self) -> Instant {
		self.deadline
	}

	pub fn is_due(&self, now: Instant) -> bool {
		now >= self.deadline
	}
}

/// Collects collections whose statistics changed and releases them in one
/// batch once the delay after the first change has passed.
#[derive(Debug)]
pub struct StatisticsDebouncer {
	pending: BTreeSet<Id>,
	delay: Duration,
	task: Option<ScheduledTask>,
}

impl StatisticsDebouncer {
	pub fn new(delay: Duration) -> Self {
		Self { pending: BTreeSet::new(), delay, task: None }
	}

	/// Record a change. Returns `true` if this armed the timer.
	pub fn notify(&mut self, collection: Id) -> bool {
		let was_empty = self.pending.is_empty();
		self.pending.insert(collection);
		if was_empty && self.task.is_none() {
			debug!("Statistics refresh scheduled in {:?}", self.delay);
			self.task = Some(ScheduledTask::after(self.delay));
			return true;
		}
		false
	}

	/// The collection is gone, no refresh needed anymore
	pub fn remove(&mut self, collection: Id) {
		self.pending.remove(&collection);
	}

	/// When the owner should call [`StatisticsDebouncer::fire`]
	pub fn deadline(&self) -> Option<Instant> {
		self.task.map(|t| t.deadline())
	}

	/// Take the collected ids if the deadline has passed
	pub fn fire(&mut self, now: Instant) -> Vec<Id> {
		match self.task {
			Some(task) if task.is_due(now) => {
				self.task = None;
				std::mem::take(&mut self.pending).into_iter().collect()
			}
			_ => Vec::new(),
		}
	}

	pub fn is_scheduled(&self) -> bool {
		self.task.is_some()
	}

	pub fn pending(&self) -> impl Iterator<Item = Id> + '_ {
		self.pending.iter().copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn test_burst_collapses_into_one_batch() {
		let mut debouncer = StatisticsDebouncer::new(Duration::from_millis(500));

		assert!(debouncer.notify(4));
		for _ in 0..19 {
			tokio::time::advance(Duration::from_millis(5)).await;
			assert!(!debouncer.notify(4));
		}
		assert!(debouncer.fire(Instant::now()).is_empty());

		let deadline = debouncer.deadline().unwrap();
		tokio::time::sleep_until(deadline).await;
		assert_eq!(debouncer.fire(Instant::now()), vec![4]);
		assert!(!debouncer.is_scheduled());
		assert!(debouncer.fire(Instant::now()).is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_timer_counts_from_first_change() {
		let mut debouncer = StatisticsDebouncer::new(Duration::from_millis(500));
		let start = Instant::now();
		debouncer.notify(1);
		tokio::time::advance(Duration::from_millis(400)).await;
		debouncer.notify(2);

		assert_eq!(debouncer.deadline(), Some(start + Duration::from_millis(500)));
		tokio::time::advance(Duration::from_millis(100)).await;
		assert_eq!(debouncer.fire(Instant::now()), vec![1, 2]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_removed_collection_is_not_refreshed() {
		let mut debouncer = StatisticsDebouncer::new(Duration::from_millis(500));
		debouncer.notify(1);
		debouncer.notify(2);
		debouncer.remove(1);
		assert_eq!(debouncer.pending().collect::<Vec<_>>(), vec![2]);

		tokio::time::advance(Duration::from_millis(500)).await;
		assert_eq!(debouncer.fire(Instant::now()), vec![2]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_rearms_after_firing() {
		let mut debouncer = StatisticsDebouncer::new(Duration::from_millis(100));
		debouncer.notify(1);
		tokio::time::advance(Duration::from_millis(100)).await;
		debouncer.fire(Instant::now());

		assert!(debouncer.notify(1));
		assert!(debouncer.is_scheduled());
	}
}
