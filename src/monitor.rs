//! The single controlling task
//!
//! All filtering, cache bookkeeping, pipeline state and reference counting
//! happen here, on one task, without locks. Fetches run on their own tasks
//! and report back over channels; the observer receives [`MonitorEvent`]s
//! over an unbounded channel in acceptance order.

use crate::cache::{CacheEntity, EntityCache, EntityFetcher, FetchCompletion};
use crate::change_log::{ChangeLog, ItemChanges};
use crate::config::{MonitorConfig, WatchConfiguration};
use crate::entities::{Collection, CollectionStatistics, Id, Item, ItemFetchScope};
use crate::error::{MonitorError, Result};
use crate::events::{EventInterest, MonitorEvent};
use crate::filter::{self, NotificationFilter};
use crate::notification::{ChangeNotification, EntityKind, NotificationEntity, Operation, FLAGS_PART};
use crate::pipeline::{DataAvailability, Enqueued, NotificationPipeline, Readiness, Settled};
use crate::reference::ReferenceTracker;
use crate::statistics::{StatisticsCompletion, StatisticsDebouncer, StatisticsFetcher};
use crate::stats::{PendingWatermark, PipelineStats};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Requests handled by the controlling task
#[derive(Debug)]
pub enum MonitorCommand {
	Notify(ChangeNotification),
	SetWatchConfiguration(WatchConfiguration),
	Reference(Id),
	Dereference(Id, oneshot::Sender<Option<Id>>),
	TakeChanges(Id, oneshot::Sender<Option<ItemChanges>>),
	Stats(oneshot::Sender<PipelineStats>),
	Stop,
}

/// Receiving ends of the fetch completion channels
pub struct Completions {
	items: mpsc::UnboundedReceiver<FetchCompletion<Item>>,
	collections: mpsc::UnboundedReceiver<FetchCompletion<Collection>>,
	statistics: mpsc::UnboundedReceiver<StatisticsCompletion>,
}

/// How an emission attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emission {
	Delivered,
	/// Nobody is interested in the resulting events
	Unheard,
	/// The entities vanished while the notification was queued
	Invalid,
}

pub struct Monitor {
	config: MonitorConfig,
	watch: WatchConfiguration,
	item_cache: EntityCache<Item>,
	collection_cache: EntityCache<Collection>,
	references: ReferenceTracker,
	pipeline: NotificationPipeline,
	statistics: StatisticsDebouncer,
	statistics_fetcher: Arc<dyn StatisticsFetcher>,
	statistics_tx: mpsc::UnboundedSender<StatisticsCompletion>,
	change_log: ChangeLog,
	stats: PipelineStats,
	watermark: PendingWatermark,
	events: mpsc::UnboundedSender<MonitorEvent>,
}

impl Monitor {
	pub fn new(
		config: MonitorConfig, watch: WatchConfiguration, items: Arc<dyn EntityFetcher<Item>>,
		collections: Arc<dyn EntityFetcher<Collection>>, statistics: Arc<dyn StatisticsFetcher>,
		events: mpsc::UnboundedSender<MonitorEvent>,
	) -> Result<(Self, Completions)> {
		config.validate()?;

		let (items_tx, items_rx) = mpsc::unbounded_channel();
		let (collections_tx, collections_rx) = mpsc::unbounded_channel();
		let (statistics_tx, statistics_rx) = mpsc::unbounded_channel();

		let monitor = Self {
			item_cache: EntityCache::new(config.item_cache_capacity, items, items_tx, config.fetch_timeout),
			collection_cache: EntityCache::new(
				config.collection_cache_capacity,
				collections,
				collections_tx,
				config.fetch_timeout,
			),
			references: ReferenceTracker::new(config.purge_buffer_capacity),
			pipeline: NotificationPipeline::new(config.pipeline_depth),
			statistics: StatisticsDebouncer::new(config.statistics_delay),
			statistics_fetcher: statistics,
			statistics_tx,
			change_log: ChangeLog::new(),
			stats: PipelineStats::new(),
			watermark: PendingWatermark::new(config.pending_warning_threshold),
			events,
			watch,
			config,
		};
		let completions = Completions {
			items: items_rx,
			collections: collections_rx,
			statistics: statistics_rx,
		};
		Ok((monitor, completions))
	}

	/// Feed one raw notification from the transport
	pub fn submit(&mut self, notification: ChangeNotification) {
		self.stats.record_received();
		self.invalidate_caches(&notification);
		self.update_pending_statistics(&notification);

		let filter = filter_for(&self.config, &self.watch, &self.references);
		if filter.lazily_ignored(&notification, true) || !filter::accept(&notification, &self.watch) {
			debug!(
				"Ignoring {:?} {:?} notification for {:?}",
				notification.kind,
				notification.operation,
				notification.ids().collect::<Vec<_>>()
			);
			self.stats.record_rejected();
			return;
		}
		self.stats.record_accepted();

		let notification = self.convert_flags(notification);
		for queued in self.translate(notification) {
			match self.pipeline.enqueue(queued) {
				Enqueued::Appended => {}
				Enqueued::Merged => self.stats.merged += 1,
				Enqueued::Superseded(dropped) => self.stats.superseded += dropped as u64,
			}
		}
		self.watermark.observe(self.pipeline.pending_len());
		self.pump();
	}

	/// Replace the watch configuration and drop queued notifications that no
	/// longer pass
	pub fn set_watch_configuration(&mut self, watch: WatchConfiguration) {
		self.watch = watch;
		self.cleanup();
		self.pump();
	}

	pub fn reference(&mut self, collection: Id) {
		self.references.reference(collection);
	}

	/// Release one reference. Returns the collection pushed out of the purge
	/// buffer, whose cached items are gone afterwards.
	pub fn dereference(&mut self, collection: Id) -> Option<Id> {
		let evicted = self.references.dereference(collection)?;
		// a concurrent reference may have brought it back
		if !self.references.is_monitored(evicted) {
			let purged = self.item_cache.purge_children(evicted);
			debug!("Purged {} cached items of collection {}", purged, evicted);
		}
		Some(evicted)
	}

	pub fn take_changes(&mut self, item: Id) -> Option<ItemChanges> {
		self.change_log.take(item)
	}

	pub fn stats(&self) -> PipelineStats {
		let mut stats = self.stats.clone();
		stats.pending = self.pipeline.pending_len();
		stats.in_flight = self.pipeline.in_flight_len();
		stats.item_fetches = self.item_cache.fetches_issued();
		stats.collection_fetches = self.collection_cache.fetches_issued();
		stats.referenced_collections = self.references.referenced_len();
		stats.buffered_collections = self.references.buffer().len();
		stats
	}

	pub fn references(&self) -> &ReferenceTracker {
		&self.references
	}

	pub fn on_item_fetched(&mut self, completion: FetchCompletion<Item>) {
		if completion.result.is_err() {
			self.stats.fetch_failures += 1;
		}
		self.item_cache.complete(completion);
		// any completion is a pulse, even a stale one
		self.pump();
	}

	pub fn on_collection_fetched(&mut self, completion: FetchCompletion<Collection>) {
		if completion.result.is_err() {
			self.stats.fetch_failures += 1;
		}
		self.collection_cache.complete(completion);
		self.pump();
	}

	pub fn on_statistics_fetched(&mut self, completion: StatisticsCompletion) {
		match completion.result {
			Ok(statistics) => {
				self.deliver(MonitorEvent::CollectionStatisticsChanged {
					collection_id: completion.collection,
					statistics,
				});
			}
			Err(e) => {
				warn!("Error fetching statistics of collection {}: {}", completion.collection, e);
			}
		}
	}

	/// Refresh statistics of the collections collected so far, if the
	/// debounce delay has passed
	pub fn flush_statistics(&mut self, now: Instant) {
		for collection in self.statistics.fire(now) {
			self.stats.statistics_refreshes += 1;
			if self.config.fetch_statistics {
				self.spawn_statistics_fetch(collection);
			} else {
				self.deliver(MonitorEvent::CollectionStatisticsChanged {
					collection_id: collection,
					statistics: CollectionStatistics::default(),
				});
			}
		}
	}

	/// Drive the monitor until stopped or every handle is dropped
	pub async fn run(
		mut self, mut completions: Completions, mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
	) {
		info!(
			"Monitor started (pipeline depth {}, reference tracking: {})",
			self.pipeline.depth(),
			self.config.reference_tracking
		);

		loop {
			let deadline = self.statistics.deadline();
			tokio::select! {
				command = commands.recv() => match command {
					Some(MonitorCommand::Stop) | None => break,
					Some(command) => self.handle_command(command),
				},
				Some(done) = completions.items.recv() => self.on_item_fetched(done),
				Some(done) = completions.collections.recv() => self.on_collection_fetched(done),
				Some(done) = completions.statistics.recv() => self.on_statistics_fetched(done),
				_ = wait_until(deadline) => self.flush_statistics(Instant::now()),
			}
		}

		let stats = self.stats();
		info!(
			"Monitor stopped: {} received, {} emitted, {} still queued",
			stats.received,
			stats.emitted,
			stats.queued()
		);
	}

	fn handle_command(&mut self, command: MonitorCommand) {
		match command {
			MonitorCommand::Notify(notification) => self.submit(notification),
			MonitorCommand::SetWatchConfiguration(watch) => self.set_watch_configuration(watch),
			MonitorCommand::Reference(id) => self.reference(id),
			MonitorCommand::Dereference(id, reply) => {
				let evicted = self.dereference(id);
				if reply.send(evicted).is_err() {
					debug!("Dereference caller went away");
				}
			}
			MonitorCommand::TakeChanges(id, reply) => {
				let changes = self.take_changes(id);
				if reply.send(changes).is_err() {
					debug!("Change log caller went away");
				}
			}
			MonitorCommand::Stats(reply) => {
				if reply.send(self.stats()).is_err() {
					debug!("Stats caller went away");
				}
			}
			MonitorCommand::Stop => {}
		}
	}

	/// Cached copies are stale as soon as the change is announced, whether or
	/// not the notification is accepted
	fn invalidate_caches(&mut self, notification: &ChangeNotification) {
		let kind = notification.kind;
		match notification.operation {
			Operation::Remove => {
				for id in notification.ids() {
					match kind {
						EntityKind::Item => self.item_cache.invalidate(id),
						EntityKind::Collection => self.collection_cache.invalidate(id),
					}
				}
			}
			Operation::Modify | Operation::ModifyFlags | Operation::Move | Operation::Subscribe => {
				for id in notification.ids() {
					match kind {
						EntityKind::Item => self.item_cache.update(id, &self.config.item_fetch_scope),
						EntityKind::Collection => {
							self.collection_cache.update(id, &self.config.collection_fetch_scope)
						}
					}
				}
			}
			_ => {}
		}
	}

	fn update_pending_statistics(&mut self, notification: &ChangeNotification) {
		match notification.kind {
			EntityKind::Item => {
				self.notify_statistics(notification.parent, notification.resource.as_deref());
				self.notify_statistics(
					notification.destination,
					notification.destination_resource.as_deref(),
				);
			}
			EntityKind::Collection if notification.operation == Operation::Remove => {
				for id in notification.ids() {
					self.statistics.remove(id);
				}
			}
			EntityKind::Collection => {}
		}
	}

	fn notify_statistics(&mut self, collection: Option<Id>, resource: Option<&str>) {
		let Some(collection) = collection.filter(|id| *id > 0) else {
			return;
		};
		if self.watch.monitor_all
			|| self.watch.is_collection_watched(collection)
			|| self.watch.is_resource_watched(resource)
		{
			self.statistics.notify(collection);
		}
	}

	/// Observers that only listen to plain item changes get flag changes as a
	/// modification of the `FLAGS` part
	fn convert_flags(&self, mut notification: ChangeNotification) -> ChangeNotification {
		let interests = &self.watch.interests;
		if notification.kind == EntityKind::Item
			&& notification.operation == Operation::ModifyFlags
			&& !interests.contains(EventInterest::ItemsFlagsChanged)
			&& interests.contains(EventInterest::ItemChanged)
		{
			notification.operation = Operation::Modify;
			notification.parts = [FLAGS_PART.to_string()].into_iter().collect();
		}
		notification
	}

	/// Rewrite item moves across the reference boundary and split batches the
	/// observer receives one entity at a time
	fn translate(&self, notification: ChangeNotification) -> Vec<ChangeNotification> {
		if self.config.reference_tracking
			&& notification.kind == EntityKind::Item
			&& notification.is_move()
		{
			let monitored = |id: Option<Id>| id.is_some_and(|id| self.references.is_monitored(id));
			let source = monitored(notification.parent);
			let destination = monitored(notification.destination);
			return match (source, destination) {
				(true, true) => vec![notification],
				(true, false) => {
					debug!("Move out of {:?} rewritten as removal", notification.parent);
					vec![notification.into_removal()]
				}
				(false, true) => {
					debug!("Move into {:?} rewritten as insertion", notification.destination);
					notification.into_insertions()
				}
				(false, false) => {
					debug!("Move between unmonitored collections dropped");
					Vec::new()
				}
			};
		}

		let split = match notification.kind {
			EntityKind::Item => {
				matches!(notification.operation, Operation::Add | Operation::Modify)
			}
			EntityKind::Collection => true,
		};
		if split {
			notification.split()
		} else {
			vec![notification]
		}
	}

	/// Release everything the pipeline lets go of, until it stops moving.
	/// Each notification is emitted before the next one is asked for, so no
	/// fetch started in between can evict the data it is emitted with.
	fn pump(&mut self) {
		loop {
			let settled = {
				let mut data = FetchContext {
					items: &mut self.item_cache,
					collections: &mut self.collection_cache,
					config: &self.config,
				};
				self.pipeline.on_data_available(&mut data)
			};

			match settled {
				Some(Settled::Ready(notification)) => self.emit(notification),
				Some(Settled::Failed(notification)) => self.drop_failed(notification),
				None => break,
			}
		}
	}

	/// Drop a notification whose data can't be fetched. The failed entries are
	/// forgotten so later notifications fetch them again.
	fn drop_failed(&mut self, notification: ChangeNotification) {
		warn!(
			"Dropping {:?} {:?} notification for {:?}: fetching its data failed",
			notification.kind,
			notification.operation,
			notification.ids().collect::<Vec<_>>()
		);
		self.stats.dropped_failed += 1;

		for id in [notification.parent, notification.destination].into_iter().flatten() {
			if self.collection_cache.is_failed(id) {
				self.collection_cache.invalidate(id);
			}
		}
		for id in notification.ids() {
			match notification.kind {
				EntityKind::Item if self.item_cache.is_failed(id) => self.item_cache.invalidate(id),
				EntityKind::Collection if self.collection_cache.is_failed(id) => {
					self.collection_cache.invalidate(id)
				}
				_ => {}
			}
		}
	}

	fn emit(&mut self, notification: ChangeNotification) {
		let parent = notification.parent.and_then(|id| self.collection_cache.retrieve(id));
		let destination = if notification.is_move() {
			notification.destination.and_then(|id| self.collection_cache.retrieve(id))
		} else {
			None
		};

		let emission = match notification.kind {
			EntityKind::Item => self.emit_items(&notification, parent, destination),
			EntityKind::Collection => self.emit_collections(&notification, parent, destination),
		};

		match emission {
			Emission::Delivered => self.stats.record_emitted(),
			Emission::Invalid => {
				debug!(
					"Dropping {:?} notification, {:?} {:?} no longer exists",
					notification.operation,
					notification.kind,
					notification.ids().collect::<Vec<_>>()
				);
				self.stats.dropped += 1;
			}
			Emission::Unheard => {
				self.stats.dropped += 1;
				// interests may have narrowed, stop working for nobody
				self.cleanup();
			}
		}
	}

	fn emit_items(
		&mut self, notification: &ChangeNotification, parent: Option<Collection>,
		destination: Option<Collection>,
	) -> Emission {
		let cached: Vec<Option<Item>> = notification.ids().map(|id| self.item_cache.retrieve(id)).collect();
		if notification.operation != Operation::Remove
			&& self.config.fetches_items()
			&& cached.iter().all(Option::is_none)
		{
			return Emission::Invalid;
		}

		let source = parent.unwrap_or_else(|| {
			Collection::placeholder(notification.parent, notification.resource.as_deref())
		});
		let target = destination.unwrap_or_else(|| {
			Collection::placeholder(
				notification.destination,
				notification.destination_resource.as_deref(),
			)
		});
		let scope = self.config.fetches_items().then_some(&self.config.item_fetch_scope);
		let items: Vec<Item> = notification
			.entities
			.iter()
			.zip(cached)
			.map(|(entity, cached)| resolve_item(notification, entity, cached, &source, &target, scope))
			.collect();

		let events = match notification.operation {
			Operation::Add => items
				.into_iter()
				.map(|item| MonitorEvent::ItemAdded { item, collection: source.clone() })
				.collect(),
			Operation::Modify => items
				.into_iter()
				.map(|item| MonitorEvent::ItemChanged { item, parts: notification.parts.clone() })
				.collect(),
			Operation::ModifyFlags => vec![MonitorEvent::ItemsFlagsChanged {
				items,
				added_flags: notification.added_flags.clone(),
				removed_flags: notification.removed_flags.clone(),
			}],
			Operation::Move => vec![MonitorEvent::ItemsMoved { items, source, destination: target }],
			Operation::Remove => vec![MonitorEvent::ItemsRemoved { items }],
			Operation::Link => vec![MonitorEvent::ItemsLinked { items, collection: source }],
			Operation::Unlink => vec![MonitorEvent::ItemsUnlinked { items, collection: source }],
			Operation::Subscribe | Operation::Unsubscribe => {
				debug!("No item event for {:?}", notification.operation);
				Vec::new()
			}
		};

		let mut delivered = false;
		for event in events {
			delivered |= self.deliver(event);
		}
		if !delivered {
			return Emission::Unheard;
		}

		self.record_changes(notification);
		Emission::Delivered
	}

	fn emit_collections(
		&mut self, notification: &ChangeNotification, parent: Option<Collection>,
		destination: Option<Collection>,
	) -> Emission {
		let operation = notification.operation;
		let parent = parent.unwrap_or_else(|| Collection::placeholder(notification.parent, None));
		let destination =
			destination.unwrap_or_else(|| Collection::placeholder(notification.destination, None));

		let mut emission = Emission::Invalid;
		for entity in &notification.entities {
			let cached = self.collection_cache.retrieve(entity.id);
			if cached.is_none() && operation != Operation::Remove && self.config.fetch_collections {
				continue;
			}

			let mut collection = match cached {
				Some(collection) if operation != Operation::Remove => collection,
				_ => Collection::from_notification(entity, notification.resource.as_deref()),
			};
			if collection.parent.is_none() {
				let home = if notification.is_move() { destination.id } else { parent.id };
				collection.parent = known(home);
			}

			let event = match operation {
				Operation::Add => Some(MonitorEvent::CollectionAdded { collection, parent: parent.clone() }),
				Operation::Modify => Some(MonitorEvent::CollectionChanged {
					collection,
					parts: notification.parts.clone(),
				}),
				Operation::Move => Some(MonitorEvent::CollectionMoved {
					collection,
					source: parent.clone(),
					destination: destination.clone(),
				}),
				Operation::Remove => Some(MonitorEvent::CollectionRemoved { collection }),
				Operation::Subscribe => self.subscription_event(
					EventInterest::CollectionSubscribed,
					MonitorEvent::CollectionSubscribed { collection, parent: parent.clone() },
				),
				Operation::Unsubscribe => self.subscription_event(
					EventInterest::CollectionUnsubscribed,
					MonitorEvent::CollectionUnsubscribed { collection },
				),
				Operation::ModifyFlags | Operation::Link | Operation::Unlink => {
					debug!("No collection event for {:?}", operation);
					None
				}
			};

			let heard = match event {
				Some(event) => self.deliver(event),
				None => self.subscription_heard(operation),
			};
			if heard {
				emission = Emission::Delivered;
			} else if emission == Emission::Invalid {
				emission = Emission::Unheard;
			}
		}
		emission
	}

	/// Subscription changes are swallowed in monitor-all mode
	fn subscription_event(&self, interest: EventInterest, event: MonitorEvent) -> Option<MonitorEvent> {
		if self.watch.monitor_all && self.watch.interests.contains(interest) {
			return None;
		}
		Some(event)
	}

	/// A swallowed subscription change still counts as heard
	fn subscription_heard(&self, operation: Operation) -> bool {
		let interest = match operation {
			Operation::Subscribe => EventInterest::CollectionSubscribed,
			Operation::Unsubscribe => EventInterest::CollectionUnsubscribed,
			_ => return false,
		};
		self.watch.monitor_all && self.watch.interests.contains(interest)
	}

	fn record_changes(&mut self, notification: &ChangeNotification) {
		for id in notification.ids() {
			match notification.operation {
				Operation::Modify => {
					self.change_log.record_parts(id, &notification.parts);
					self.change_log
						.record_flags(id, &notification.added_flags, &notification.removed_flags);
				}
				Operation::ModifyFlags => {
					self.change_log
						.record_flags(id, &notification.added_flags, &notification.removed_flags);
				}
				Operation::Remove => self.change_log.forget(id),
				_ => {}
			}
		}
	}

	/// Send `event` if the observer registered interest. Returns whether it
	/// was delivered.
	fn deliver(&mut self, event: MonitorEvent) -> bool {
		if !self.watch.interests.contains(event.interest()) {
			return false;
		}
		if self.events.send(event).is_err() {
			debug!("Observer dropped the event receiver");
			return false;
		}
		true
	}

	fn cleanup(&mut self) {
		let filter = filter_for(&self.config, &self.watch, &self.references);
		let removed = self.pipeline.retain(|notification| filter.accept(notification));
		if removed > 0 {
			debug!("Dropped {} queued notifications no longer of interest", removed);
			self.stats.cleaned_up += removed as u64;
		}
	}

	fn spawn_statistics_fetch(&self, collection: Id) {
		let fetcher = Arc::clone(&self.statistics_fetcher);
		let completions = self.statistics_tx.clone();
		let fetch_timeout = self.config.fetch_timeout;

		tokio::spawn(async move {
			let result = match fetch_timeout {
				Some(limit) => {
					match tokio::time::timeout(limit, fetcher.fetch_statistics(collection)).await {
						Ok(result) => result,
						Err(_) => Err(MonitorError::timeout(
							&format!("fetch statistics {collection}"),
							limit,
						)),
					}
				}
				None => fetcher.fetch_statistics(collection).await,
			};
			if completions.send(StatisticsCompletion { collection, result }).is_err() {
				debug!("Monitor stopped before statistics of {} arrived", collection);
			}
		});
	}
}

fn filter_for<'a>(
	config: &MonitorConfig, watch: &'a WatchConfiguration, references: &'a ReferenceTracker,
) -> NotificationFilter<'a> {
	let filter = NotificationFilter::new(watch).with_statistics(config.fetch_statistics);
	if config.reference_tracking {
		filter.with_references(references)
	} else {
		filter
	}
}

fn known(id: Id) -> Option<Id> {
	(id >= 0).then_some(id)
}

/// Complete a cached item (or rebuild one) with what the notification knows
fn resolve_item(
	notification: &ChangeNotification, entity: &NotificationEntity, cached: Option<Item>,
	source: &Collection, target: &Collection, scope: Option<&ItemFetchScope>,
) -> Item {
	let home = if notification.is_move() { target.id } else { source.id };
	let Some(mut item) = cached else {
		let mut item = Item::from_notification(entity);
		item.parent = known(home);
		return item;
	};

	if notification.operation == Operation::Remove {
		item.remote_id = entity.remote_id.clone();
		item.remote_revision = entity.remote_revision.clone();
		item.mime_type = entity.mime_type.clone();
	}
	match item.parent {
		None => item.parent = known(home),
		// observers must see the parent from before a move
		Some(parent) if parent != source.id && !notification.is_move() && known(source.id).is_some() => {
			item.parent = Some(source.id);
		}
		_ => {}
	}
	match scope {
		Some(scope) => item.project(scope),
		None => item,
	}
}

/// Resolves notification data through the entity caches
struct FetchContext<'a> {
	items: &'a mut EntityCache<Item>,
	collections: &'a mut EntityCache<Collection>,
	config: &'a MonitorConfig,
}

fn readiness_of<T: CacheEntity>(cache: &mut EntityCache<T>, id: Id, scope: &T::Scope) -> Readiness {
	if cache.ensure_cached(id, scope) {
		Readiness::Ready
	} else if cache.is_failed(id) {
		Readiness::Failed
	} else {
		Readiness::Pending
	}
}

impl DataAvailability for FetchContext<'_> {
	fn ensure_available(&mut self, notification: &ChangeNotification) -> Readiness {
		// the collection is gone, its identity comes from the notification
		if notification.kind == EntityKind::Collection && notification.operation == Operation::Remove {
			return Readiness::Ready;
		}

		let mut readiness = Readiness::Ready;
		if self.config.fetch_collections {
			let destination = notification.destination.filter(|_| notification.is_move());
			for id in notification.parent.into_iter().chain(destination) {
				let scope = &self.config.collection_fetch_scope;
				readiness = readiness.and(readiness_of(self.collections, id, scope));
			}
		}
		if notification.operation == Operation::Remove {
			return readiness;
		}

		match notification.kind {
			EntityKind::Item if self.config.fetches_items() => {
				let scope = item_scope_for(self.config, notification);
				for id in notification.ids() {
					readiness = readiness.and(readiness_of(self.items, id, &scope));
				}
			}
			EntityKind::Collection if self.config.fetch_collections => {
				for id in notification.ids() {
					let scope = &self.config.collection_fetch_scope;
					readiness = readiness.and(readiness_of(self.collections, id, scope));
				}
			}
			_ => {}
		}
		readiness
	}
}

fn item_scope_for(config: &MonitorConfig, notification: &ChangeNotification) -> ItemFetchScope {
	let modification = matches!(notification.operation, Operation::Modify | Operation::ModifyFlags);
	if config.fetch_changed_only && modification {
		config.item_fetch_scope.narrowed_to(&notification.parts)
	} else {
		config.item_fetch_scope.clone()
	}
}

async fn wait_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

/// Cloneable entry point for transports pushing notifications
#[derive(Debug, Clone)]
pub struct NotificationSender {
	commands: mpsc::UnboundedSender<MonitorCommand>,
}

impl NotificationSender {
	pub fn send(&self, notification: ChangeNotification) -> Result<()> {
		self.commands
			.send(MonitorCommand::Notify(notification))
			.map_err(|_| MonitorError::ChannelSend)
	}
}

/// Handle to a running monitor
#[derive(Debug)]
pub struct MonitorHandle {
	commands: mpsc::UnboundedSender<MonitorCommand>,
	task: JoinHandle<()>,
}

impl MonitorHandle {
	pub fn notify(&self, notification: ChangeNotification) -> Result<()> {
		self.send(MonitorCommand::Notify(notification))
	}

	pub fn notification_sender(&self) -> NotificationSender {
		NotificationSender { commands: self.commands.clone() }
	}

	pub fn set_watch_configuration(&self, watch: WatchConfiguration) -> Result<()> {
		self.send(MonitorCommand::SetWatchConfiguration(watch))
	}

	pub fn ref_collection(&self, collection: Id) -> Result<()> {
		self.send(MonitorCommand::Reference(collection))
	}

	/// Returns the collection evicted from the purge buffer, if any
	pub async fn deref_collection(&self, collection: Id) -> Result<Option<Id>> {
		let (tx, rx) = oneshot::channel();
		self.send(MonitorCommand::Dereference(collection, tx))?;
		rx.await.map_err(|_| MonitorError::ChannelSend)
	}

	pub async fn take_changes(&self, item: Id) -> Result<Option<ItemChanges>> {
		let (tx, rx) = oneshot::channel();
		self.send(MonitorCommand::TakeChanges(item, tx))?;
		rx.await.map_err(|_| MonitorError::ChannelSend)
	}

	pub async fn stats(&self) -> Result<PipelineStats> {
		let (tx, rx) = oneshot::channel();
		self.send(MonitorCommand::Stats(tx))?;
		rx.await.map_err(|_| MonitorError::ChannelSend)
	}

	/// Stop the controlling task and wait for it to finish
	pub async fn stop(self) -> Result<()> {
		self.commands
			.send(MonitorCommand::Stop)
			.map_err(|_| MonitorError::StopSignal)?;
		self.task.await.map_err(|_| MonitorError::StopSignal)
	}

	fn send(&self, command: MonitorCommand) -> Result<()> {
		self.commands.send(command).map_err(|_| MonitorError::ChannelSend)
	}
}

/// Spawn the controlling task. Must be called from within a tokio runtime.
pub fn start<S>(
	config: MonitorConfig, watch: WatchConfiguration, store: Arc<S>,
) -> Result<(MonitorHandle, mpsc::UnboundedReceiver<MonitorEvent>)>
where S: EntityFetcher<Item> + EntityFetcher<Collection> + StatisticsFetcher + 'static {
	let (events_tx, events_rx) = mpsc::unbounded_channel();
	let (monitor, completions) = Monitor::new(
		config,
		watch,
		store.clone(),
		store.clone(),
		store,
		events_tx,
	)?;

	let (commands_tx, commands_rx) = mpsc::unbounded_channel();
	let task = tokio::spawn(monitor.run(completions, commands_rx));
	Ok((MonitorHandle { commands: commands_tx, task }, events_rx))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::entities::ROOT_COLLECTION_ID;
	use crate::events::InterestSet;
	use crate::memory_store::MemoryStore;

	struct Harness {
		monitor: Monitor,
		completions: Completions,
		events: mpsc::UnboundedReceiver<MonitorEvent>,
		store: Arc<MemoryStore>,
	}

	impl Harness {
		fn new(config: MonitorConfig, watch: WatchConfiguration, store: MemoryStore) -> Self {
			let store = Arc::new(store);
			let (tx, events) = mpsc::unbounded_channel();
			let (monitor, completions) =
				Monitor::new(config, watch, store.clone(), store.clone(), store.clone(), tx).unwrap();
			Self { monitor, completions, events, store }
		}

		/// Feed completions back until nothing is queued anymore
		async fn settle(&mut self) {
			while !self.monitor.pipeline.is_empty() {
				tokio::select! {
					Some(done) = self.completions.items.recv() => self.monitor.on_item_fetched(done),
					Some(done) = self.completions.collections.recv() => self.monitor.on_collection_fetched(done),
				}
			}
		}

		fn drain(&mut self) -> Vec<MonitorEvent> {
			let mut events = Vec::new();
			while let Ok(event) = self.events.try_recv() {
				events.push(event);
			}
			events
		}
	}

	fn store() -> MemoryStore {
		MemoryStore::new()
			.with_collection(Collection::new(1).with_name("inbox"))
			.with_collection(Collection::new(2).with_name("archive"))
			.with_item(Item::new(10).with_parent(1).with_flag("\\Seen"))
			.with_item(Item::new(11).with_parent(1))
	}

	fn watch_all() -> WatchConfiguration {
		WatchConfiguration::new().watch_collection(ROOT_COLLECTION_ID)
	}

	#[tokio::test]
	async fn test_item_added_resolves_item_and_parent() {
		let mut h = Harness::new(MonitorConfig::fetching_items(), watch_all(), store());

		h.monitor.submit(ChangeNotification::item(Operation::Add, 10).in_collection(1));
		h.settle().await;

		let events = h.drain();
		assert_eq!(events.len(), 1);
		let MonitorEvent::ItemAdded { item, collection } = &events[0] else {
			panic!("expected ItemAdded, got {:?}", events[0]);
		};
		assert_eq!(item.id, 10);
		assert!(item.flags.contains("\\Seen"));
		assert_eq!(collection.name, "inbox");
	}

	#[tokio::test]
	async fn test_removal_is_rebuilt_from_notification() {
		let mut h = Harness::new(MonitorConfig::fetching_items(), watch_all(), store());

		let mut entity = NotificationEntity::new(10);
		entity.remote_id = Some("rid-10".to_string());
		let removal = ChangeNotification::new(EntityKind::Item, Operation::Remove)
			.with_entity_details(entity)
			.in_collection(1);
		h.monitor.submit(removal);
		h.settle().await;

		let events = h.drain();
		let MonitorEvent::ItemsRemoved { items } = &events[0] else {
			panic!("expected ItemsRemoved, got {:?}", events[0]);
		};
		assert_eq!(items[0].remote_id.as_deref(), Some("rid-10"));
		assert_eq!(items[0].parent, Some(1));
		// a removal never needs the item itself
		assert_eq!(h.store.item_fetches(), 0);
	}

	#[tokio::test]
	async fn test_batch_add_is_split() {
		let mut h = Harness::new(MonitorConfig::fetching_items(), watch_all(), store());

		h.monitor.submit(ChangeNotification::item(Operation::Add, 10).with_entity(11).in_collection(1));
		h.settle().await;

		let ids: Vec<Vec<Id>> = h.drain().iter().map(MonitorEvent::item_ids).collect();
		assert_eq!(ids, vec![vec![10], vec![11]]);
	}

	#[tokio::test]
	async fn test_flags_become_item_change_for_legacy_observers() {
		let watch = watch_all().with_interests(InterestSet::only([EventInterest::ItemChanged]));
		let mut h = Harness::new(MonitorConfig::fetching_items(), watch, store());

		h.monitor.submit(
			ChangeNotification::item(Operation::ModifyFlags, 10)
				.in_collection(1)
				.with_flags(["\\Flagged"], Vec::<&str>::new()),
		);
		h.settle().await;

		let events = h.drain();
		let MonitorEvent::ItemChanged { parts, .. } = &events[0] else {
			panic!("expected ItemChanged, got {:?}", events[0]);
		};
		assert!(parts.contains(FLAGS_PART));

		let changes = h.monitor.take_changes(10).unwrap();
		assert!(changes.added_flags.contains("\\Flagged"));
	}

	#[tokio::test]
	async fn test_vanished_item_is_not_announced() {
		let mut h = Harness::new(MonitorConfig::fetching_items(), watch_all(), store());

		h.monitor.submit(ChangeNotification::item(Operation::Modify, 99).in_collection(1));
		h.settle().await;

		assert!(h.drain().is_empty());
		assert_eq!(h.monitor.stats().dropped, 1);
	}

	#[tokio::test]
	async fn test_subscriptions_are_swallowed_in_monitor_all_mode() {
		let watch = WatchConfiguration::new().monitor_all(true);
		let mut h = Harness::new(MonitorConfig::default(), watch, store());

		h.monitor.submit(ChangeNotification::collection(Operation::Subscribe, 2).in_collection(1));
		h.settle().await;
		assert!(h.drain().is_empty());
		// swallowed, not dropped: queued notifications are left alone
		assert_eq!(h.monitor.stats().dropped, 0);

		h.monitor.set_watch_configuration(watch_all());
		h.monitor.submit(ChangeNotification::collection(Operation::Subscribe, 2).in_collection(1));
		h.settle().await;
		assert!(matches!(h.drain()[0], MonitorEvent::CollectionSubscribed { .. }));
	}

	#[tokio::test]
	async fn test_unheard_emission_cleans_up_queue() {
		let watch = watch_all().with_interests(InterestSet::only([EventInterest::ItemsLinked]));
		let mut h = Harness::new(MonitorConfig::fetching_items(), watch, store());

		// collection events are not lazily ignored, but nobody listens to them
		h.monitor.submit(ChangeNotification::collection(Operation::Modify, 2).in_collection(1));
		h.settle().await;

		assert!(h.drain().is_empty());
		let stats = h.monitor.stats();
		assert_eq!(stats.dropped, 1);
		assert_eq!(stats.emitted, 0);
	}

	#[tokio::test]
	async fn test_dereference_purges_evicted_items() {
		let config = MonitorConfig {
			purge_buffer_capacity: 1,
			reference_tracking: true,
			..MonitorConfig::fetching_items()
		};
		let mut h = Harness::new(config, watch_all(), store());

		h.monitor.reference(1);
		h.monitor.submit(ChangeNotification::item(Operation::Add, 10).in_collection(1));
		h.settle().await;
		assert!(h.monitor.item_cache.is_cached(10));

		h.monitor.reference(2);
		assert_eq!(h.monitor.dereference(1), None);
		assert!(h.monitor.item_cache.is_cached(10));
		assert_eq!(h.monitor.dereference(2), Some(1));
		assert!(!h.monitor.item_cache.is_requested(10));
	}
}
