//! In-process fetch collaborator
//!
//! Serves items, collections and statistics from memory. Latency and failures
//! can be injected per id, and every fetch is counted, which makes it the
//! store of choice for tests and for replaying recorded notification streams.

use crate::cache::EntityFetcher;
use crate::entities::{
	Collection, CollectionFetchScope, CollectionStatistics, Id, Item, ItemFetchScope,
};
use crate::error::{MonitorError, Result};
use crate::notification::EntityKind;
use crate::statistics::StatisticsFetcher;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Serializable contents of a [`MemoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
	#[serde(default)]
	pub items: Vec<Item>,
	#[serde(default)]
	pub collections: Vec<Collection>,
	#[serde(default)]
	pub statistics: HashMap<Id, CollectionStatistics>,
}

#[derive(Debug, Default)]
struct StoreData {
	items: HashMap<Id, Item>,
	collections: HashMap<Id, Collection>,
	statistics: HashMap<Id, CollectionStatistics>,
	latency: HashMap<(EntityKind, Id), Duration>,
	failing: HashSet<(EntityKind, Id)>,
}

#[derive(Debug, Default)]
struct FetchCounters {
	items: AtomicU64,
	collections: AtomicU64,
	statistics: AtomicU64,
}

/// Thread-safe in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
	data: RwLock<StoreData>,
	default_latency: Duration,
	counters: FetchCounters,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
		let store = Self::new();
		{
			let mut data = store.write();
			data.items = snapshot.items.into_iter().map(|i| (i.id, i)).collect();
			data.collections = snapshot.collections.into_iter().map(|c| (c.id, c)).collect();
			data.statistics = snapshot.statistics;
		}
		store
	}

	pub fn from_json_file(path: &Path) -> Result<Self> {
		let json = std::fs::read_to_string(path)?;
		let snapshot: StoreSnapshot = serde_json::from_str(&json)?;
		Ok(Self::from_snapshot(snapshot))
	}

	/// Latency applied to every fetch without a specific one
	pub fn with_default_latency(mut self, latency: Duration) -> Self {
		self.default_latency = latency;
		self
	}

	pub fn with_item(self, item: Item) -> Self {
		self.insert_item(item);
		self
	}

	pub fn with_collection(self, collection: Collection) -> Self {
		self.insert_collection(collection);
		self
	}

	pub fn insert_item(&self, item: Item) {
		self.write().items.insert(item.id, item);
	}

	pub fn remove_item(&self, id: Id) -> Option<Item> {
		self.write().items.remove(&id)
	}

	pub fn insert_collection(&self, collection: Collection) {
		self.write().collections.insert(collection.id, collection);
	}

	pub fn remove_collection(&self, id: Id) -> Option<Collection> {
		self.write().collections.remove(&id)
	}

	pub fn set_statistics(&self, collection: Id, statistics: CollectionStatistics) {
		self.write().statistics.insert(collection, statistics);
	}

	/// Delay fetches of one entity
	pub fn set_latency(&self, kind: EntityKind, id: Id, latency: Duration) {
		self.write().latency.insert((kind, id), latency);
	}

	/// Make fetches of one entity fail until cleared
	pub fn set_failing(&self, kind: EntityKind, id: Id, failing: bool) {
		let mut data = self.write();
		if failing {
			data.failing.insert((kind, id));
		} else {
			data.failing.remove(&(kind, id));
		}
	}

	pub fn item_fetches(&self) -> u64 {
		self.counters.items.load(Ordering::SeqCst)
	}

	pub fn collection_fetches(&self) -> u64 {
		self.counters.collections.load(Ordering::SeqCst)
	}

	pub fn statistics_fetches(&self) -> u64 {
		self.counters.statistics.load(Ordering::SeqCst)
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
		self.data.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
		self.data.write().unwrap_or_else(PoisonError::into_inner)
	}

	/// Simulated round trip. The lock is never held across the sleep.
	async fn round_trip(&self, kind: EntityKind, id: Id) -> Result<()> {
		let (latency, failing) = {
			let data = self.read();
			let latency = data.latency.get(&(kind, id)).copied().unwrap_or(self.default_latency);
			(latency, data.failing.contains(&(kind, id)))
		};
		if !latency.is_zero() {
			tokio::time::sleep(latency).await;
		}
		if failing {
			debug!("Injected failure for {:?} {}", kind, id);
			return Err(MonitorError::fetch_failed(kind, id, "injected failure"));
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl EntityFetcher<Item> for MemoryStore {
	async fn fetch(&self, id: Id, scope: &ItemFetchScope) -> Result<Option<Item>> {
		self.counters.items.fetch_add(1, Ordering::SeqCst);
		self.round_trip(EntityKind::Item, id).await?;
		Ok(self.read().items.get(&id).map(|item| item.project(scope)))
	}
}

#[async_trait::async_trait]
impl EntityFetcher<Collection> for MemoryStore {
	async fn fetch(&self, id: Id, scope: &CollectionFetchScope) -> Result<Option<Collection>> {
		self.counters.collections.fetch_add(1, Ordering::SeqCst);
		self.round_trip(EntityKind::Collection, id).await?;

		let data = self.read();
		let Some(collection) = data.collections.get(&id) else {
			return Ok(None);
		};
		let mut collection = collection.clone();
		collection.statistics = if scope.include_statistics {
			Some(data.statistics.get(&id).copied().unwrap_or_default())
		} else {
			None
		};
		if !scope.all_attributes {
			collection.attributes.clear();
		}
		Ok(Some(collection))
	}
}

#[async_trait::async_trait]
impl StatisticsFetcher for MemoryStore {
	async fn fetch_statistics(&self, collection: Id) -> Result<CollectionStatistics> {
		self.counters.statistics.fetch_add(1, Ordering::SeqCst);
		self.round_trip(EntityKind::Collection, collection).await?;

		let data = self.read();
		if !data.collections.contains_key(&collection) {
			return Err(MonitorError::NotFound { kind: EntityKind::Collection, id: collection });
		}
		Ok(data.statistics.get(&collection).copied().unwrap_or_default())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn store() -> MemoryStore {
		MemoryStore::new()
			.with_collection(Collection::new(1).with_name("inbox"))
			.with_item(Item::new(10).with_parent(1).with_payload("HEAD", "h").with_payload("BODY", "b"))
	}

	#[tokio::test]
	async fn test_fetch_projects_item_scope() {
		let store = store();
		let scope = ItemFetchScope::default().with_payload_part("HEAD");
		let item = EntityFetcher::<Item>::fetch(&store, 10, &scope).await.unwrap().unwrap();

		assert!(item.payload.contains_key("HEAD"));
		assert!(!item.payload.contains_key("BODY"));
		assert_eq!(store.item_fetches(), 1);
	}

	#[tokio::test]
	async fn test_missing_entity_is_none() {
		let store = store();
		let item = EntityFetcher::<Item>::fetch(&store, 99, &ItemFetchScope::full()).await.unwrap();
		assert!(item.is_none());

		store.remove_collection(1);
		let scope = CollectionFetchScope::default();
		assert!(EntityFetcher::<Collection>::fetch(&store, 1, &scope).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_injected_failure() {
		let store = store();
		store.set_failing(EntityKind::Item, 10, true);
		let result = EntityFetcher::<Item>::fetch(&store, 10, &ItemFetchScope::full()).await;
		assert!(matches!(result, Err(MonitorError::Fetch { id: 10, .. })));

		store.set_failing(EntityKind::Item, 10, false);
		assert!(EntityFetcher::<Item>::fetch(&store, 10, &ItemFetchScope::full()).await.is_ok());
	}

	#[tokio::test(start_paused = true)]
	async fn test_injected_latency() {
		let store = store();
		store.set_latency(EntityKind::Item, 10, Duration::from_millis(100));

		let start = tokio::time::Instant::now();
		EntityFetcher::<Item>::fetch(&store, 10, &ItemFetchScope::full()).await.unwrap();
		assert!(start.elapsed() >= Duration::from_millis(100));
	}

	#[tokio::test]
	async fn test_statistics() {
		let store = store();
		store.set_statistics(1, CollectionStatistics { count: 3, unread: 1, size: 512 });

		let stats = store.fetch_statistics(1).await.unwrap();
		assert_eq!(stats.count, 3);
		assert!(matches!(store.fetch_statistics(2).await, Err(MonitorError::NotFound { .. })));
		assert_eq!(store.statistics_fetches(), 2);

		let scope = CollectionFetchScope { include_statistics: true, ..Default::default() };
		let collection = EntityFetcher::<Collection>::fetch(&store, 1, &scope).await.unwrap().unwrap();
		assert_eq!(collection.statistics.map(|s| s.unread), Some(1));
	}

	#[test]
	fn test_snapshot_from_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"{{"collections":[{{"id":1,"name":"inbox"}}],"items":[{{"id":5,"parent":1}}],"statistics":{{"1":{{"count":1,"unread":0,"size":10}}}}}}"#
		)
		.unwrap();

		let store = MemoryStore::from_json_file(file.path()).unwrap();
		assert!(store.read().items.contains_key(&5));
		assert_eq!(store.read().statistics[&1].size, 10);
	}
}
