use super::{CacheEntity, EntityFetcher, FetchCompletion, FetchScope};
use crate::entities::Id;
use crate::error::MonitorError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
	/// A fetch is outstanding
	Pending,
	/// Resolved; the value may still be absent if the entity is gone server-side
	Ready,
	/// The last fetch failed or timed out
	Failed,
}

/// A single cached entity
#[derive(Debug)]
pub struct CacheEntry<T: CacheEntity> {
	pub id: Id,
	value: Option<T>,
	scope: T::Scope,
	state: EntryState,
	dirty: bool,
	token: u64,
}

impl<T: CacheEntity> CacheEntry<T> {
	pub fn value(&self) -> Option<&T> {
		self.value.as_ref()
	}

	pub fn scope(&self) -> &T::Scope {
		&self.scope
	}

	pub fn is_pending(&self) -> bool {
		self.state == EntryState::Pending
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}
}

/// In-memory LRU cache for a small number of entities of one kind.
///
/// Misses are filled asynchronously: the fetch runs on its own task and its
/// outcome is sent back over the completion channel, to be applied with
/// [`EntityCache::complete`] by the controlling task.
pub struct EntityCache<T: CacheEntity> {
	entries: HashMap<Id, CacheEntry<T>>,
	order: VecDeque<Id>,
	capacity: usize,
	fetcher: Arc<dyn EntityFetcher<T>>,
	completions: mpsc::UnboundedSender<FetchCompletion<T>>,
	fetch_timeout: Option<Duration>,
	next_token: u64,
	fetches_issued: u64,
}

impl<T: CacheEntity> EntityCache<T> {
	pub fn new(
		capacity: usize, fetcher: Arc<dyn EntityFetcher<T>>,
		completions: mpsc::UnboundedSender<FetchCompletion<T>>, fetch_timeout: Option<Duration>,
	) -> Self {
		Self {
			entries: HashMap::new(),
			order: VecDeque::new(),
			capacity: capacity.max(1),
			fetcher,
			completions,
			fetch_timeout,
			next_token: 0,
			fetches_issued: 0,
		}
	}

	/// Entity is resolved and can be retrieved
	pub fn is_cached(&self, id: Id) -> bool {
		self.entries
			.get(&id)
			.is_some_and(|e| e.state == EntryState::Ready)
	}

	/// Entity has been requested, whatever its current state
	pub fn is_requested(&self, id: Id) -> bool {
		self.entries.contains_key(&id)
	}

	/// The last fetch for `id` failed or timed out
	pub fn is_failed(&self, id: Id) -> bool {
		self.entries
			.get(&id)
			.is_some_and(|e| e.state == EntryState::Failed)
	}

	pub fn entry(&self, id: Id) -> Option<&CacheEntry<T>> {
		self.entries.get(&id)
	}

	/// Returns `true` if a valid entry satisfying `scope` is held. Otherwise a
	/// fetch is started (unless one is already outstanding) and `false` is
	/// returned.
	pub fn ensure_cached(&mut self, id: Id, scope: &T::Scope) -> bool {
		let Some((state, satisfied)) = self
			.entries
			.get(&id)
			.map(|e| (e.state, !e.dirty && e.scope.covers(scope)))
		else {
			self.request(id, scope.clone());
			return false;
		};

		self.touch(id);
		if state != EntryState::Ready {
			return false;
		}
		if !satisfied {
			self.refetch(id, scope.clone());
		}
		satisfied
	}

	/// Returns the best value currently held, never triggers a fetch
	pub fn retrieve(&self, id: Id) -> Option<T> {
		self.entries.get(&id).and_then(|e| e.value.clone())
	}

	/// Drop the entry entirely, the entity is gone server-side
	pub fn invalidate(&mut self, id: Id) {
		if self.entries.remove(&id).is_some() {
			self.order.retain(|other| *other != id);
		}
	}

	/// The held copy is stale: the next `ensure_cached` must fetch again.
	/// An outstanding fetch is superseded by a fresh one.
	pub fn update(&mut self, id: Id, scope: &T::Scope) {
		let Some(state) = self.entries.get(&id).map(|e| e.state) else {
			return;
		};

		match state {
			EntryState::Pending => self.refetch(id, scope.clone()),
			EntryState::Ready => {
				if let Some(entry) = self.entries.get_mut(&id) {
					entry.dirty = true;
				}
			}
			EntryState::Failed => self.invalidate(id),
		}
	}

	/// Apply a finished fetch. Returns `false` if the completion was stale
	/// (its entry got invalidated or re-requested in the meantime).
	pub fn complete(&mut self, completion: FetchCompletion<T>) -> bool {
		let FetchCompletion { id, token, result } = completion;
		let Some(entry) = self.entries.get_mut(&id) else {
			debug!("Dropping fetch result for evicted {:?} {}", T::KIND, id);
			return false;
		};
		if entry.token != token || entry.state != EntryState::Pending {
			debug!("Dropping superseded fetch result for {:?} {}", T::KIND, id);
			return false;
		}

		entry.dirty = false;
		match result {
			Ok(Some(incoming)) => {
				match entry.value.as_mut() {
					Some(existing) => T::merge(existing, incoming),
					None => entry.value = Some(incoming),
				}
				entry.state = EntryState::Ready;
			}
			Ok(None) => {
				debug!("{:?} {} no longer exists", T::KIND, id);
				entry.value = None;
				entry.state = EntryState::Ready;
			}
			Err(error) => {
				warn!("Fetching {:?} {} failed: {}", T::KIND, id, error);
				entry.value = None;
				entry.state = EntryState::Failed;
			}
		}
		true
	}

	/// Drop resolved entries whose parent is `parent`. Returns how many went.
	pub fn purge_children(&mut self, parent: Id) -> usize {
		let doomed: Vec<Id> = self
			.entries
			.values()
			.filter(|e| e.state != EntryState::Pending)
			.filter(|e| e.value.as_ref().and_then(T::parent) == Some(parent))
			.map(|e| e.id)
			.collect();
		for id in &doomed {
			self.invalidate(*id);
		}
		doomed.len()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn fetches_issued(&self) -> u64 {
		self.fetches_issued
	}

	fn request(&mut self, id: Id, scope: T::Scope) {
		debug_assert!(!self.is_requested(id));
		self.shrink();
		let token = self.spawn_fetch(id, scope.clone());
		self.entries.insert(
			id,
			CacheEntry {
				id,
				value: None,
				scope,
				state: EntryState::Pending,
				dirty: false,
				token,
			},
		);
		self.order.push_back(id);
	}

	fn refetch(&mut self, id: Id, scope: T::Scope) {
		let token = self.spawn_fetch(id, scope.clone());
		if let Some(entry) = self.entries.get_mut(&id) {
			entry.scope = scope;
			entry.state = EntryState::Pending;
			entry.token = token;
		}
	}

	/// Mark `id` as the most recently used entry
	fn touch(&mut self, id: Id) {
		if self.order.back() == Some(&id) {
			return;
		}
		if let Some(position) = self.order.iter().position(|other| *other == id) {
			self.order.remove(position);
			self.order.push_back(id);
		}
	}

	/// Evict the least recently used resolved entries until one more fits. Stops at the
	/// first pending entry so outstanding fetches keep their slot.
	fn shrink(&mut self) {
		while self.entries.len() >= self.capacity {
			let Some(oldest) = self.order.front().copied() else {
				break;
			};
			if self.entries.get(&oldest).is_some_and(CacheEntry::is_pending) {
				break;
			}
			self.order.pop_front();
			self.entries.remove(&oldest);
		}
	}

	fn spawn_fetch(&mut self, id: Id, scope: T::Scope) -> u64 {
		self.next_token += 1;
		self.fetches_issued += 1;
		let token = self.next_token;
		let fetcher = Arc::clone(&self.fetcher);
		let completions = self.completions.clone();
		let fetch_timeout = self.fetch_timeout;

		debug!("Fetching {:?} {} with {:?}", T::KIND, id, scope);
		tokio::spawn(async move {
			let result = match fetch_timeout {
				Some(limit) => match tokio::time::timeout(limit, fetcher.fetch(id, &scope)).await {
					Ok(result) => result,
					Err(_) => Err(MonitorError::timeout(&format!("fetch {:?} {id}", T::KIND), limit)),
				},
				None => fetcher.fetch(id, &scope).await,
			};
			if completions.send(FetchCompletion { id, token, result }).is_err() {
				debug!("Cache dropped before fetch of {:?} {} finished", T::KIND, id);
			}
		});
		token
	}
}
