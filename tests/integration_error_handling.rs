// Integration tests for fetch failures, timeouts and lifecycle errors

use entity_monitor::{start, EntityKind, MonitorConfig, MonitorError, MonitorEvent};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::INBOX;

fn with_timeout(timeout: Duration) -> MonitorConfig {
	MonitorConfig { fetch_timeout: Some(timeout), ..MonitorConfig::fetching_items() }
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout_drops_only_the_head() {
	let store = Arc::new(common::mail_store());
	store.set_latency(EntityKind::Item, 10, Duration::from_secs(5));
	let (handle, mut events) =
		common::monitor(with_timeout(Duration::from_millis(50)), common::watch_root(), &store);

	handle.notify(common::item_added(10, INBOX)).unwrap();
	handle.notify(common::item_added(11, INBOX)).unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(common::item_ids(&events), vec![vec![11]]);

	let stats = handle.stats().await.unwrap();
	assert_eq!(stats.dropped_failed, 1);
	assert_eq!(stats.fetch_failures, 1);
	assert_eq!(stats.emitted, 1);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_entity_is_fetched_again_later() {
	let store = Arc::new(common::mail_store());
	store.set_failing(EntityKind::Item, 10, true);
	let (handle, mut events) = common::monitor(MonitorConfig::fetching_items(), common::watch_root(), &store);

	handle.notify(common::item_added(10, INBOX)).unwrap();
	assert!(common::next_event(&mut events).await.is_none());
	assert_eq!(handle.stats().await.unwrap().dropped_failed, 1);

	store.set_failing(EntityKind::Item, 10, false);
	handle.notify(common::item_added(10, INBOX)).unwrap();
	match common::next_event(&mut events).await {
		Some(MonitorEvent::ItemAdded { item, .. }) => {
			assert_eq!(item.id, 10);
			assert_eq!(item.payload.get("HEAD").map(String::as_str), Some("Subject: message 10"));
		}
		other => panic!("Expected ItemAdded, got {other:?}"),
	}
	assert_eq!(store.item_fetches(), 2);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_parent_collection_drops_notification() {
	let store = Arc::new(common::mail_store());
	store.set_failing(EntityKind::Collection, INBOX, true);
	let (handle, mut events) = common::monitor(MonitorConfig::fetching_items(), common::watch_root(), &store);

	handle.notify(common::item_added(10, INBOX)).unwrap();
	handle.notify(common::item_added(11, common::ARCHIVE)).unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(common::item_ids(&events), vec![vec![11]]);
	assert_eq!(handle.stats().await.unwrap().dropped_failed, 1);

	handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deleted_item_is_dropped_silently() {
	let store = Arc::new(common::mail_store());
	store.remove_item(10);
	let (handle, mut events) = common::monitor(MonitorConfig::fetching_items(), common::watch_root(), &store);

	handle.notify(common::item_added(10, INBOX)).unwrap();
	handle.notify(common::item_added(11, INBOX)).unwrap();

	let events = common::collect_events(&mut events).await;
	assert_eq!(common::item_ids(&events), vec![vec![11]]);
	let stats = handle.stats().await.unwrap();
	assert_eq!(stats.dropped, 1);
	assert_eq!(stats.dropped_failed, 0);

	handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
	let store = Arc::new(common::mail_store());
	let config = MonitorConfig { pipeline_depth: 0, ..MonitorConfig::default() };

	let result = start(config, common::watch_root(), store);
	assert!(matches!(result, Err(MonitorError::Configuration { .. })));
}

#[tokio::test]
async fn test_stop_closes_event_stream() {
	let store = Arc::new(common::mail_store());
	let (handle, mut events) = common::monitor(MonitorConfig::default(), common::watch_root(), &store);
	let sender = handle.notification_sender();

	let stop_result = handle.stop().await;
	assert!(stop_result.is_ok(), "Monitor should stop cleanly");
	assert!(events.recv().await.is_none());
	assert!(matches!(
		sender.send(common::item_added(10, INBOX)),
		Err(MonitorError::ChannelSend)
	));
}
