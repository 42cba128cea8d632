//! Ordered delivery of accepted notifications
//!
//! Accepted notifications wait in `pending` until a slot in `in_flight` frees
//! up. Once in flight, only the head is ever checked for readiness, so a
//! notification never overtakes one accepted before it.

use crate::notification::{ChangeNotification, Operation};
use std::collections::VecDeque;
use tracing::debug;

/// State of the data a notification depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
	/// Everything referenced is resolved
	Ready,
	/// At least one fetch is still outstanding
	Pending,
	/// A fetch failed or timed out; the notification can never be completed
	Failed,
}

impl Readiness {
	/// Failure dominates, then outstanding fetches
	pub fn and(self, other: Readiness) -> Readiness {
		match (self, other) {
			(Readiness::Failed, _) | (_, Readiness::Failed) => Readiness::Failed,
			(Readiness::Pending, _) | (_, Readiness::Pending) => Readiness::Pending,
			_ => Readiness::Ready,
		}
	}
}

/// Makes sure the data a notification references is available locally.
///
/// Implementations start fetches for anything missing and report what is
/// resolved so far; they must not block.
pub trait DataAvailability {
	fn ensure_available(&mut self, notification: &ChangeNotification) -> Readiness;
}

/// A notification that left the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
	/// All data is available, emit it
	Ready(ChangeNotification),
	/// Its data can't be fetched, drop it
	Failed(ChangeNotification),
}

/// What happened to a newly queued notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
	Appended,
	/// Folded into an equivalent pending notification
	Merged,
	/// Appended after dropping this many earlier notifications it supersedes
	Superseded(usize),
}

#[derive(Debug)]
pub struct NotificationPipeline {
	pending: VecDeque<ChangeNotification>,
	in_flight: VecDeque<ChangeNotification>,
	depth: usize,
}

impl NotificationPipeline {
	pub fn new(depth: usize) -> Self {
		let depth = depth.max(1);
		Self {
			pending: VecDeque::new(),
			in_flight: VecDeque::with_capacity(depth),
			depth,
		}
	}

	/// Queue an accepted notification, compressing it into what is already
	/// pending where possible. In-flight notifications are never touched.
	pub fn enqueue(&mut self, notification: ChangeNotification) -> Enqueued {
		match notification.operation {
			Operation::Remove => {
				let dropped = self.supersede(&notification);
				self.pending.push_back(notification);
				if dropped > 0 {
					Enqueued::Superseded(dropped)
				} else {
					Enqueued::Appended
				}
			}
			Operation::Modify | Operation::ModifyFlags => {
				if self.merge(&notification) {
					Enqueued::Merged
				} else {
					self.pending.push_back(notification);
					Enqueued::Appended
				}
			}
			_ => {
				self.pending.push_back(notification);
				Enqueued::Appended
			}
		}
	}

	/// Move pending notifications in flight while there is room. A notification
	/// whose data is already there skips the queue only if nothing is in flight,
	/// and is handed back right away, before anything else gets admitted.
	pub fn dispatch<D: DataAvailability>(&mut self, data: &mut D) -> Option<Settled> {
		while self.in_flight.len() < self.depth {
			let notification = self.pending.pop_front()?;

			let readiness = data.ensure_available(&notification);
			match readiness {
				Readiness::Ready if self.in_flight.is_empty() => {
					return Some(Settled::Ready(notification));
				}
				Readiness::Failed if self.in_flight.is_empty() => {
					return Some(Settled::Failed(notification));
				}
				_ => self.in_flight.push_back(notification),
			}
		}
		None
	}

	/// Some fetch finished: release the head if it can go, otherwise refill.
	///
	/// Yields one notification at a time. The caller has to be done with it
	/// before calling again: refilling starts fetches, and those may evict
	/// cached data the released notification still needs.
	pub fn on_data_available<D: DataAvailability>(&mut self, data: &mut D) -> Option<Settled> {
		self.release_head(data).or_else(|| self.dispatch(data))
	}

	/// Drop queued notifications that no longer pass `keep`. Returns how many
	/// were removed.
	pub fn retain<F>(&mut self, mut keep: F) -> usize
	where F: FnMut(&ChangeNotification) -> bool {
		let before = self.len();
		self.in_flight.retain(|n| keep(n));
		self.pending.retain(|n| keep(n));
		before - self.len()
	}

	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	pub fn in_flight_len(&self) -> usize {
		self.in_flight.len()
	}

	pub fn len(&self) -> usize {
		self.pending.len() + self.in_flight.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending.is_empty() && self.in_flight.is_empty()
	}

	pub fn depth(&self) -> usize {
		self.depth
	}

	fn release_head<D: DataAvailability>(&mut self, data: &mut D) -> Option<Settled> {
		let readiness = data.ensure_available(self.in_flight.front()?);
		match readiness {
			Readiness::Pending => None,
			Readiness::Ready => self.in_flight.pop_front().map(Settled::Ready),
			Readiness::Failed => self.in_flight.pop_front().map(Settled::Failed),
		}
	}

	/// A removal makes earlier pending notifications about the same entities
	/// pointless. Returns how many pending notifications were dropped.
	fn supersede(&mut self, removal: &ChangeNotification) -> usize {
		let mut dropped = 0;
		self.pending.retain_mut(|queued| {
			if queued.kind != removal.kind || queued.operation == Operation::Remove {
				return true;
			}
			queued.entities.retain(|e| !removal.involves(e.id));
			if queued.entities.is_empty() {
				dropped += 1;
				return false;
			}
			true
		});
		if dropped > 0 {
			debug!("Removal superseded {} pending notifications", dropped);
		}
		dropped
	}

	/// Fold a modification into a pending one for the same entities. Only the
	/// latest pending notification touching those entities is a candidate, so
	/// nothing gets reordered.
	fn merge(&mut self, incoming: &ChangeNotification) -> bool {
		let Some(queued) = self.pending.iter_mut().rev().find(|queued| {
			queued.kind == incoming.kind && incoming.ids().any(|id| queued.involves(id))
		}) else {
			return false;
		};
		if queued.operation != incoming.operation
			|| queued.parent != incoming.parent
			|| queued.session != incoming.session
			|| queued.entities != incoming.entities
		{
			return false;
		}

		match incoming.operation {
			Operation::Modify => {
				queued.parts.extend(incoming.parts.iter().cloned());
			}
			Operation::ModifyFlags => {
				for flag in &incoming.added_flags {
					queued.removed_flags.remove(flag);
					queued.added_flags.insert(flag.clone());
				}
				for flag in &incoming.removed_flags {
					queued.added_flags.remove(flag);
					queued.removed_flags.insert(flag.clone());
				}
			}
			_ => return false,
		}
		true
	}
}

impl Default for NotificationPipeline {
	fn default() -> Self {
		Self::new(crate::config::DEFAULT_PIPELINE_DEPTH)
	}
}
