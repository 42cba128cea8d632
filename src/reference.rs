//! Reference counting of actively used collections
//!
//! A collection id lives in exactly one of three places: the reference map
//! (someone is using it), the purge buffer (recently released, still kept
//! warm) or nowhere.

use crate::entities::Id;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error};

/// Default number of recently released collections kept warm
pub const DEFAULT_PURGE_BUFFER_CAPACITY: usize = 10;

/// Fixed-capacity ring of recently dereferenced collection ids
#[derive(Debug, Clone)]
pub struct PurgeBuffer {
	buffer: VecDeque<Id>,
	capacity: usize,
}

impl PurgeBuffer {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self { buffer: VecDeque::with_capacity(capacity), capacity }
	}

	/// Buffer `id`, moving it to the newest slot if already present.
	///
	/// Returns the id evicted from the oldest slot to make room, if any.
	pub fn buffer(&mut self, id: Id) -> Option<Id> {
		self.purge(id);

		let mut bumped = None;
		if self.buffer.len() == self.capacity {
			bumped = self.buffer.pop_front();
		}
		self.buffer.push_back(id);
		bumped
	}

	/// Stop buffering `id`
	pub fn purge(&mut self, id: Id) {
		self.buffer.retain(|other| *other != id);
	}

	pub fn is_buffered(&self, id: Id) -> bool {
		self.buffer.contains(&id)
	}

	pub fn len(&self) -> usize {
		self.buffer.len()
	}

	pub fn is_empty(&self) -> bool {
		self.buffer.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Buffered ids, oldest first
	pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
		self.buffer.iter().copied()
	}
}

impl Default for PurgeBuffer {
	fn default() -> Self {
		Self::new(DEFAULT_PURGE_BUFFER_CAPACITY)
	}
}

/// Reference counts plus the purge buffer they spill into
#[derive(Debug, Clone, Default)]
pub struct ReferenceTracker {
	counts: HashMap<Id, usize>,
	buffer: PurgeBuffer,
}

impl ReferenceTracker {
	pub fn new(buffer_capacity: usize) -> Self {
		Self { counts: HashMap::new(), buffer: PurgeBuffer::new(buffer_capacity) }
	}

	pub fn reference(&mut self, id: Id) {
		*self.counts.entry(id).or_insert(0) += 1;
		// in active use again, must not be evicted
		if self.buffer.is_buffered(id) {
			self.buffer.purge(id);
		}
	}

	/// Drop one reference. When the count reaches zero the id moves into the
	/// purge buffer; the id evicted from the buffer to make room is returned.
	pub fn dereference(&mut self, id: Id) -> Option<Id> {
		let Some(count) = self.counts.get_mut(&id) else {
			debug_assert!(false, "dereferencing collection {id} which is not referenced");
			error!("Dereferencing collection {} which is not referenced", id);
			return None;
		};

		*count -= 1;
		if *count > 0 {
			return None;
		}

		self.counts.remove(&id);
		let evicted = self.buffer.buffer(id);
		if let Some(evicted) = evicted {
			debug!("Collection {} fell out of the purge buffer", evicted);
		}
		evicted
	}

	/// Actively referenced
	pub fn is_referenced(&self, id: Id) -> bool {
		self.counts.contains_key(&id)
	}

	pub fn is_buffered(&self, id: Id) -> bool {
		self.buffer.is_buffered(id)
	}

	/// Referenced or still warm in the buffer
	pub fn is_monitored(&self, id: Id) -> bool {
		self.is_referenced(id) || self.is_buffered(id)
	}

	pub fn reference_count(&self, id: Id) -> usize {
		self.counts.get(&id).copied().unwrap_or(0)
	}

	pub fn buffer(&self) -> &PurgeBuffer {
		&self.buffer
	}

	pub fn referenced_len(&self) -> usize {
		self.counts.len()
	}
}
