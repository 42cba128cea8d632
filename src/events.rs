use crate::entities::{Collection, CollectionStatistics, Id, Item};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// High-level change events delivered to the observer, one per accepted and
/// fully resolved notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum MonitorEvent {
	ItemAdded {
		item: Item,
		collection: Collection,
	},
	ItemChanged {
		item: Item,
		parts: BTreeSet<String>,
	},
	ItemsFlagsChanged {
		items: Vec<Item>,
		added_flags: BTreeSet<String>,
		removed_flags: BTreeSet<String>,
	},
	ItemsMoved {
		items: Vec<Item>,
		source: Collection,
		destination: Collection,
	},
	ItemsRemoved {
		items: Vec<Item>,
	},
	ItemsLinked {
		items: Vec<Item>,
		collection: Collection,
	},
	ItemsUnlinked {
		items: Vec<Item>,
		collection: Collection,
	},
	CollectionAdded {
		collection: Collection,
		parent: Collection,
	},
	CollectionChanged {
		collection: Collection,
		parts: BTreeSet<String>,
	},
	CollectionMoved {
		collection: Collection,
		source: Collection,
		destination: Collection,
	},
	CollectionRemoved {
		collection: Collection,
	},
	CollectionSubscribed {
		collection: Collection,
		parent: Collection,
	},
	CollectionUnsubscribed {
		collection: Collection,
	},
	CollectionStatisticsChanged {
		collection_id: Id,
		statistics: CollectionStatistics,
	},
}

impl MonitorEvent {
	pub fn interest(&self) -> EventInterest {
		match self {
			MonitorEvent::ItemAdded { .. } => EventInterest::ItemAdded,
			MonitorEvent::ItemChanged { .. } => EventInterest::ItemChanged,
			MonitorEvent::ItemsFlagsChanged { .. } => EventInterest::ItemsFlagsChanged,
			MonitorEvent::ItemsMoved { .. } => EventInterest::ItemsMoved,
			MonitorEvent::ItemsRemoved { .. } => EventInterest::ItemsRemoved,
			MonitorEvent::ItemsLinked { .. } => EventInterest::ItemsLinked,
			MonitorEvent::ItemsUnlinked { .. } => EventInterest::ItemsUnlinked,
			MonitorEvent::CollectionAdded { .. } => EventInterest::CollectionAdded,
			MonitorEvent::CollectionChanged { .. } => EventInterest::CollectionChanged,
			MonitorEvent::CollectionMoved { .. } => EventInterest::CollectionMoved,
			MonitorEvent::CollectionRemoved { .. } => EventInterest::CollectionRemoved,
			MonitorEvent::CollectionSubscribed { .. } => EventInterest::CollectionSubscribed,
			MonitorEvent::CollectionUnsubscribed { .. } => EventInterest::CollectionUnsubscribed,
			MonitorEvent::CollectionStatisticsChanged { .. } => {
				EventInterest::CollectionStatisticsChanged
			}
		}
	}

	/// Ids of the items carried by this event, empty for collection events
	pub fn item_ids(&self) -> Vec<Id> {
		match self {
			MonitorEvent::ItemAdded { item, .. } | MonitorEvent::ItemChanged { item, .. } => {
				vec![item.id]
			}
			MonitorEvent::ItemsFlagsChanged { items, .. }
			| MonitorEvent::ItemsMoved { items, .. }
			| MonitorEvent::ItemsRemoved { items }
			| MonitorEvent::ItemsLinked { items, .. }
			| MonitorEvent::ItemsUnlinked { items, .. } => items.iter().map(|i| i.id).collect(),
			_ => Vec::new(),
		}
	}

	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}

/// Kinds of events an observer can register interest in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventInterest {
	ItemAdded,
	ItemChanged,
	ItemsFlagsChanged,
	ItemsMoved,
	ItemsRemoved,
	ItemsLinked,
	ItemsUnlinked,
	CollectionAdded,
	CollectionChanged,
	CollectionMoved,
	CollectionRemoved,
	CollectionSubscribed,
	CollectionUnsubscribed,
	CollectionStatisticsChanged,
}

impl EventInterest {
	pub const ALL: [EventInterest; 14] = [
		EventInterest::ItemAdded,
		EventInterest::ItemChanged,
		EventInterest::ItemsFlagsChanged,
		EventInterest::ItemsMoved,
		EventInterest::ItemsRemoved,
		EventInterest::ItemsLinked,
		EventInterest::ItemsUnlinked,
		EventInterest::CollectionAdded,
		EventInterest::CollectionChanged,
		EventInterest::CollectionMoved,
		EventInterest::CollectionRemoved,
		EventInterest::CollectionSubscribed,
		EventInterest::CollectionUnsubscribed,
		EventInterest::CollectionStatisticsChanged,
	];
}

/// The event kinds the observer listens to.
///
/// Used to skip work for notifications nobody would see. Defaults to every
/// kind, in which case nothing is skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct InterestSet(HashSet<EventInterest>);

impl InterestSet {
	pub fn all() -> Self {
		Self(EventInterest::ALL.into_iter().collect())
	}

	pub fn none() -> Self {
		Self(HashSet::new())
	}

	pub fn only<I: IntoIterator<Item = EventInterest>>(interests: I) -> Self {
		Self(interests.into_iter().collect())
	}

	pub fn with(mut self, interest: EventInterest) -> Self {
		self.0.insert(interest);
		self
	}

	pub fn without(mut self, interest: EventInterest) -> Self {
		self.0.remove(&interest);
		self
	}

	pub fn contains(&self, interest: EventInterest) -> bool {
		self.0.contains(&interest)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl Default for InterestSet {
	fn default() -> Self {
		Self::all()
	}
}
