use serde::{Deserialize, Serialize};
use tracing::warn;

/// Counters describing what the monitor did with the notifications it saw
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
	pub received: u64,
	pub accepted: u64,
	pub rejected: u64,
	/// Folded into an equivalent pending notification
	pub merged: u64,
	/// Dropped because a later removal made them pointless
	pub superseded: u64,
	pub emitted: u64,
	/// Resolved, but the entities turned out to be gone or nobody listened
	pub dropped: u64,
	/// Dropped because a fetch they depended on failed or timed out
	pub dropped_failed: u64,
	/// Removed from the queues after a watch configuration change
	pub cleaned_up: u64,
	pub item_fetches: u64,
	pub collection_fetches: u64,
	pub fetch_failures: u64,
	pub statistics_refreshes: u64,
	pub pending: usize,
	pub in_flight: usize,
	pub referenced_collections: usize,
	pub buffered_collections: usize,
}

impl PipelineStats {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_received(&mut self) {
		self.received += 1;
	}

	pub fn record_rejected(&mut self) {
		self.rejected += 1;
	}

	pub fn record_accepted(&mut self) {
		self.accepted += 1;
	}

	pub fn record_emitted(&mut self) {
		self.emitted += 1;
	}

	pub fn queued(&self) -> usize {
		self.pending + self.in_flight
	}
}

/// Warns once each time the pending queue grows past a threshold, which
/// usually means the in-flight head is stuck on a fetch.
#[derive(Debug, Clone)]
pub struct PendingWatermark {
	threshold: usize,
	exceeded: bool,
}

impl PendingWatermark {
	pub fn new(threshold: usize) -> Self {
		Self { threshold, exceeded: false }
	}

	/// Returns `true` when this observation crossed the threshold
	pub fn observe(&mut self, pending: usize) -> bool {
		if pending > self.threshold {
			if !self.exceeded {
				self.exceeded = true;
				warn!(
					"{} notifications pending (threshold {}), pipeline head may be stalled",
					pending, self.threshold
				);
				return true;
			}
		} else {
			self.exceeded = false;
		}
		false
	}
}
