// Integration tests for delivery order and queue compression
// Time is paused: fetch latencies advance virtual time only

use entity_monitor::{ChangeNotification, EntityKind, MemoryStore, MonitorConfig, MonitorEvent, Operation};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{INBOX, TRASH};

fn config(depth: usize) -> MonitorConfig {
	MonitorConfig { pipeline_depth: depth, ..MonitorConfig::fetching_items() }
}

fn slow_store(slow: i64, fast: i64) -> Arc<MemoryStore> {
	let store = common::mail_store();
	store.set_latency(EntityKind::Item, slow, Duration::from_millis(100));
	store.set_latency(EntityKind::Item, fast, Duration::from_millis(10));
	Arc::new(store)
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_does_not_reorder_events() {
	let store = slow_store(10, 11);
	let (handle, mut events) = common::monitor(config(5), common::watch_root(), &store);

	handle.notify(common::item_added(10, INBOX)).unwrap();
	handle.notify(common::item_added(11, INBOX)).unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(common::item_ids(&events), vec![vec![10], vec![11]]);
	// both fetches ran concurrently
	assert_eq!(store.item_fetches(), 2);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_pipeline_keeps_order() {
	let store = slow_store(10, 11);
	let (handle, mut events) = common::monitor(config(1), common::watch_root(), &store);

	for id in [10, 11, 12] {
		handle.notify(common::item_added(id, INBOX)).unwrap();
	}

	let events = common::collect_events(&mut events).await;
	assert_eq!(common::item_ids(&events), vec![vec![10], vec![11], vec![12]]);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_modifications_are_merged() {
	let store = slow_store(12, 11);
	let (handle, mut events) = common::monitor(config(1), common::watch_root(), &store);

	// 12 blocks the only slot while both modifications queue up
	handle.notify(common::item_added(12, INBOX)).unwrap();
	handle
		.notify(ChangeNotification::item(Operation::Modify, 10).in_collection(INBOX).with_parts(["PLD:HEAD"]))
		.unwrap();
	handle
		.notify(ChangeNotification::item(Operation::Modify, 10).in_collection(INBOX).with_parts(["PLD:BODY"]))
		.unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(events.len(), 2);
	assert!(matches!(&events[0], MonitorEvent::ItemAdded { item, .. } if item.id == 12));
	match &events[1] {
		MonitorEvent::ItemChanged { item, parts } => {
			assert_eq!(item.id, 10);
			assert!(parts.contains("PLD:HEAD"));
			assert!(parts.contains("PLD:BODY"));
		}
		other => panic!("Expected ItemChanged, got {other:?}"),
	}

	let stats = handle.stats().await.unwrap();
	assert_eq!(stats.merged, 1);
	assert_eq!(stats.emitted, 2);

	// both modifications reach the change log
	let changes = handle.take_changes(10).await.unwrap().unwrap();
	assert_eq!(changes.parts.len(), 2);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_removal_supersedes_pending_modification() {
	let store = slow_store(12, 11);
	let (handle, mut events) = common::monitor(config(1), common::watch_root(), &store);

	handle.notify(common::item_added(12, INBOX)).unwrap();
	handle
		.notify(ChangeNotification::item(Operation::Modify, 10).in_collection(INBOX).with_parts(["PLD:HEAD"]))
		.unwrap();
	handle.notify(ChangeNotification::item(Operation::Remove, 10).in_collection(INBOX)).unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(events.len(), 2);
	assert!(matches!(&events[1], MonitorEvent::ItemsRemoved { items } if items[0].id == 10));
	assert_eq!(handle.stats().await.unwrap().superseded, 1);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_collection_events_wait_for_item_events_ahead_of_them() {
	let store = slow_store(10, 11);
	let (handle, mut events) = common::monitor(config(5), common::watch_root(), &store);

	handle.notify(common::item_added(10, INBOX)).unwrap();
	handle
		.notify(ChangeNotification::collection(Operation::Modify, TRASH).in_collection(0).with_parts(["NAME"]))
		.unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(events.len(), 2);
	assert!(matches!(events[0], MonitorEvent::ItemAdded { .. }));
	match &events[1] {
		MonitorEvent::CollectionChanged { collection, parts } => {
			assert_eq!(collection.name, "trash");
			assert!(parts.contains("NAME"));
		}
		other => panic!("Expected CollectionChanged, got {other:?}"),
	}

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_notifications_from_several_senders() {
	let store = Arc::new(common::mail_store());
	let (handle, mut events) = common::monitor(config(5), common::watch_root(), &store);

	let sender = handle.notification_sender();
	let task = tokio::spawn(async move {
		for id in 10..15 {
			sender.send(common::item_added(id, INBOX)).unwrap();
		}
	});
	task.await.unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(
		common::item_ids(&events),
		(10..15).map(|id| vec![id]).collect::<Vec<_>>()
	);

	handle.stop().await.unwrap();
}

fn modified(id: i64) -> ChangeNotification {
	ChangeNotification::item(Operation::Modify, id).in_collection(INBOX).with_parts(["PLD:HEAD"])
}

#[tokio::test(start_paused = true)]
async fn test_refetched_item_survives_eviction_by_later_fetches() {
	let store = Arc::new(common::mail_store());
	let config = MonitorConfig { item_cache_capacity: 5, ..config(5) };
	let (handle, mut events) = common::monitor(config, common::watch_root(), &store);

	// fill the cache with 10..15
	for id in 10..15 {
		handle.notify(common::item_added(id, INBOX)).unwrap();
	}
	assert_eq!(common::collect_events(&mut events).await.len(), 5);

	// 10 comes back fast while slow fetches for 15..20 push it out
	for id in 15..20 {
		store.set_latency(EntityKind::Item, id, Duration::from_millis(500));
	}
	handle.notify(modified(10)).unwrap();
	for id in 15..20 {
		handle.notify(common::item_added(id, INBOX)).unwrap();
	}

	let events = common::collect_events(&mut events).await;
	assert!(matches!(&events[0], MonitorEvent::ItemChanged { item, .. } if item.id == 10));
	assert_eq!(
		common::item_ids(&events),
		vec![vec![10], vec![15], vec![16], vec![17], vec![18], vec![19]]
	);
	assert_eq!(handle.stats().await.unwrap().dropped, 0);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_full_cache_and_queue_deliver_every_change_in_order() {
	let store = Arc::new(common::mail_store());
	for id in 10..20 {
		let latency = if id % 2 == 0 { 50 } else { 5 };
		store.set_latency(EntityKind::Item, id, Duration::from_millis(latency));
	}
	let config = MonitorConfig { item_cache_capacity: 2, ..config(2) };
	let (handle, mut events) = common::monitor(config, common::watch_root(), &store);

	for id in 10..14 {
		handle.notify(common::item_added(id, INBOX)).unwrap();
	}
	assert_eq!(common::collect_events(&mut events).await.len(), 4);

	// ten changes against two in-flight slots and two cache entries
	for id in 10..20 {
		handle.notify(modified(id)).unwrap();
	}

	let events = common::collect_events(&mut events).await;
	assert!(events.iter().all(|e| matches!(e, MonitorEvent::ItemChanged { .. })));
	let expected: Vec<Vec<i64>> = (10..20).map(|id| vec![id]).collect();
	assert_eq!(common::item_ids(&events), expected);

	let stats = handle.stats().await.unwrap();
	assert_eq!(stats.dropped, 0);
	assert_eq!(stats.dropped_failed, 0);
	assert_eq!(stats.queued(), 0);

	handle.stop().await.unwrap();
}
