//! Monitor tuning and the observer's watch configuration

use crate::cache::FetchScope;
use crate::entities::{CollectionFetchScope, Id, ItemFetchScope, ROOT_COLLECTION_ID};
use crate::error::{MonitorError, Result};
use crate::events::InterestSet;
use crate::notification::{EntityKind, SessionId};
use crate::reference::DEFAULT_PURGE_BUFFER_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default number of notifications that may wait on fetches at once
pub const DEFAULT_PIPELINE_DEPTH: usize = 5;

/// Default delay used to coalesce statistics refreshes
pub const DEFAULT_STATISTICS_DELAY: Duration = Duration::from_millis(500);

/// Configuration for the monitor core
#[derive(Debug, Clone)]
pub struct MonitorConfig {
	/// Maximum number of notifications waiting on cache fills
	pub pipeline_depth: usize,
	/// Recently released collections kept warm before their items are purged
	pub purge_buffer_capacity: usize,
	/// Delay between the first statistics change and the refresh
	pub statistics_delay: Duration,
	/// Limit for a single fetch; `None` waits forever
	pub fetch_timeout: Option<Duration>,
	pub item_cache_capacity: usize,
	pub collection_cache_capacity: usize,
	/// Gate item notifications on referenced or buffered collections
	pub reference_tracking: bool,
	/// Resolve parent and destination collections before emitting
	pub fetch_collections: bool,
	/// Ask the store for statistics instead of emitting zero placeholders
	pub fetch_statistics: bool,
	/// Only fetch the parts a modification reported as changed
	pub fetch_changed_only: bool,
	/// What to fetch for items; an empty scope disables item fetching
	pub item_fetch_scope: ItemFetchScope,
	pub collection_fetch_scope: CollectionFetchScope,
	/// Pending queue size above which a stalled head is suspected
	pub pending_warning_threshold: usize,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			pipeline_depth: DEFAULT_PIPELINE_DEPTH,
			purge_buffer_capacity: DEFAULT_PURGE_BUFFER_CAPACITY,
			statistics_delay: DEFAULT_STATISTICS_DELAY,
			fetch_timeout: Some(Duration::from_secs(30)),
			item_cache_capacity: 50,
			collection_cache_capacity: 50,
			reference_tracking: false,
			fetch_collections: true,
			fetch_statistics: false,
			fetch_changed_only: false,
			item_fetch_scope: ItemFetchScope::default(),
			collection_fetch_scope: CollectionFetchScope::default(),
			pending_warning_threshold: 1000,
		}
	}
}

impl MonitorConfig {
	/// Default configuration that fetches full items
	pub fn fetching_items() -> Self {
		Self { item_fetch_scope: ItemFetchScope::full(), ..Default::default() }
	}

	/// Validate the configuration and return errors if invalid
	pub fn validate(&self) -> Result<()> {
		if self.pipeline_depth == 0 {
			return Err(MonitorError::configuration_error(
				"pipeline_depth",
				"must be greater than 0",
			));
		}

		if self.purge_buffer_capacity == 0 {
			return Err(MonitorError::configuration_error(
				"purge_buffer_capacity",
				"must be greater than 0",
			));
		}

		// A Move keeps two collections and the item pinned per in-flight slot
		if self.item_cache_capacity < self.pipeline_depth {
			return Err(MonitorError::configuration_error(
				"item_cache_capacity",
				&format!("must be at least the pipeline depth ({})", self.pipeline_depth),
			));
		}
		if self.collection_cache_capacity < self.pipeline_depth {
			return Err(MonitorError::configuration_error(
				"collection_cache_capacity",
				&format!("must be at least the pipeline depth ({})", self.pipeline_depth),
			));
		}

		if self.fetch_timeout.is_some_and(|t| t.is_zero()) {
			return Err(MonitorError::configuration_error("fetch_timeout", "must not be zero"));
		}

		if self.pending_warning_threshold == 0 {
			return Err(MonitorError::configuration_error(
				"pending_warning_threshold",
				"must be greater than 0",
			));
		}

		Ok(())
	}

	/// Items are only fetched when the scope asks for something
	pub fn fetches_items(&self) -> bool {
		!self.item_fetch_scope.is_empty()
	}
}

/// What the observer is interested in. Replaced wholesale by the observer;
/// read by the filter on every notification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchConfiguration {
	/// Watched collection ids; [`ROOT_COLLECTION_ID`] watches everything
	#[serde(default)]
	pub collections: BTreeSet<Id>,
	#[serde(default)]
	pub items: BTreeSet<Id>,
	#[serde(default)]
	pub resources: BTreeSet<String>,
	#[serde(default)]
	pub mime_types: BTreeSet<String>,
	/// Sessions whose own writes should not be echoed back
	#[serde(default)]
	pub ignored_sessions: HashSet<SessionId>,
	/// Restricts notifications to these entity kinds when non-empty
	#[serde(default)]
	pub kinds: HashSet<EntityKind>,
	#[serde(default)]
	pub monitor_all: bool,
	#[serde(default)]
	pub interests: InterestSet,
}

impl WatchConfiguration {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn watch_collection(mut self, id: Id) -> Self {
		self.collections.insert(id);
		self
	}

	pub fn watch_item(mut self, id: Id) -> Self {
		self.items.insert(id);
		self
	}

	pub fn watch_resource(mut self, resource: &str) -> Self {
		self.resources.insert(resource.to_string());
		self
	}

	pub fn watch_mime_type(mut self, mime_type: &str) -> Self {
		self.mime_types.insert(mime_type.to_string());
		self
	}

	pub fn ignore_session(mut self, session: SessionId) -> Self {
		self.ignored_sessions.insert(session);
		self
	}

	pub fn monitor_all(mut self, enabled: bool) -> Self {
		self.monitor_all = enabled;
		self
	}

	pub fn watch_kind(mut self, kind: EntityKind) -> Self {
		self.kinds.insert(kind);
		self
	}

	pub fn with_interests(mut self, interests: InterestSet) -> Self {
		self.interests = interests;
		self
	}

	/// Exact id or the root wildcard, never recursive into subtrees
	pub fn is_collection_watched(&self, id: Id) -> bool {
		self.collections.contains(&ROOT_COLLECTION_ID) || self.collections.contains(&id)
	}

	pub fn is_item_watched(&self, id: Id) -> bool {
		self.items.contains(&id)
	}

	pub fn is_resource_watched(&self, resource: Option<&str>) -> bool {
		resource.is_some_and(|r| self.resources.contains(r))
	}

	pub fn is_mime_type_watched(&self, mime_type: Option<&str>) -> bool {
		mime_type.is_some_and(|m| self.mime_types.contains(m))
	}

	pub fn is_session_ignored(&self, session: Option<&SessionId>) -> bool {
		session.is_some_and(|s| self.ignored_sessions.contains(s))
	}

	pub fn is_kind_watched(&self, kind: EntityKind) -> bool {
		self.kinds.is_empty() || self.kinds.contains(&kind)
	}

	pub fn from_json(json: &str) -> Result<Self> {
		Ok(serde_json::from_str(json)?)
	}

	pub fn from_file(path: &Path) -> Result<Self> {
		let json = std::fs::read_to_string(path)?;
		Self::from_json(&json)
	}
}
