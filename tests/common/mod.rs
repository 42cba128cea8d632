//! Common test utilities for the entity-monitor library

#![allow(unused_imports, dead_code)]

use entity_monitor::{
	start, ChangeNotification, Collection, EntityKind, EventInterest, Id, InterestSet, Item, MemoryStore, MonitorConfig,
	MonitorEvent, MonitorHandle, Operation, WatchConfiguration,
};
use entity_monitor::entities::ROOT_COLLECTION_ID as ROOT;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const INBOX: Id = 1;
pub const ARCHIVE: Id = 2;
pub const TRASH: Id = 3;

/// Three collections under the root, items 10..20 in the inbox
pub fn mail_store() -> MemoryStore {
	let store = MemoryStore::new()
		.with_collection(Collection::new(INBOX).with_parent(ROOT).with_name("inbox"))
		.with_collection(Collection::new(ARCHIVE).with_parent(ROOT).with_name("archive"))
		.with_collection(Collection::new(TRASH).with_parent(ROOT).with_name("trash"));
	for id in 10..20 {
		store.insert_item(
			Item::new(id)
				.with_parent(INBOX)
				.with_mime_type("message/rfc822")
				.with_payload("HEAD", &format!("Subject: message {id}")),
		);
	}
	store
}

/// Watches everything through the root collection. Statistics refreshes are
/// left out so they don't interleave with the events under test.
pub fn watch_root() -> WatchConfiguration {
	WatchConfiguration::new()
		.watch_collection(ROOT)
		.with_interests(InterestSet::all().without(EventInterest::CollectionStatisticsChanged))
}

pub fn monitor(
	config: MonitorConfig, watch: WatchConfiguration, store: &Arc<MemoryStore>,
) -> (MonitorHandle, UnboundedReceiver<MonitorEvent>) {
	start(config, watch, Arc::clone(store)).expect("Failed to start monitor")
}

pub fn item_added(id: Id, collection: Id) -> ChangeNotification {
	ChangeNotification::item(Operation::Add, id).in_collection(collection)
}

pub fn item_moved(id: Id, from: Id, to: Id) -> ChangeNotification {
	ChangeNotification::item(Operation::Move, id).in_collection(from).moved_to(to)
}

/// Next event, or `None` if nothing arrives within a (virtual) second
pub async fn next_event(events: &mut UnboundedReceiver<MonitorEvent>) -> Option<MonitorEvent> {
	tokio::time::timeout(Duration::from_secs(1), events.recv())
		.await
		.ok()
		.flatten()
}

/// Collect events until none arrived for a (virtual) second
pub async fn collect_events(events: &mut UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
	let mut collected = Vec::new();
	while let Some(event) = next_event(events).await {
		collected.push(event);
	}
	collected
}

/// Ids of the items each event carries, one entry per event
pub fn item_ids(events: &[MonitorEvent]) -> Vec<Vec<Id>> {
	events.iter().map(MonitorEvent::item_ids).collect()
}

pub async fn wait_until_idle(handle: &MonitorHandle) {
	for _ in 0..1000 {
		let stats = handle.stats().await.expect("Monitor stopped");
		if stats.queued() == 0 {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("Monitor did not become idle");
}
