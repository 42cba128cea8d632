//! Entities mirrored from the remote store and the scopes used to fetch them

use crate::cache::{CacheEntity, FetchScope};
use crate::notification::{EntityKind, NotificationEntity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stable numeric entity id
pub type Id = i64;

/// Sentinel collection id meaning "watch everything"
pub const ROOT_COLLECTION_ID: Id = 0;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Collection {
	pub id: Id,
	#[serde(default)]
	pub parent: Option<Id>,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub remote_id: Option<String>,
	#[serde(default)]
	pub resource: Option<String>,
	#[serde(default)]
	pub content_mime_types: BTreeSet<String>,
	#[serde(default)]
	pub attributes: BTreeMap<String, String>,
	#[serde(default)]
	pub statistics: Option<CollectionStatistics>,
}

impl Collection {
	pub fn new(id: Id) -> Self {
		Self { id, ..Default::default() }
	}

	pub fn with_parent(mut self, parent: Id) -> Self {
		self.parent = Some(parent);
		self
	}

	pub fn with_resource(mut self, resource: &str) -> Self {
		self.resource = Some(resource.to_string());
		self
	}

	pub fn with_name(mut self, name: &str) -> Self {
		self.name = name.to_string();
		self
	}

	/// Minimal collection rebuilt from what a notification carries
	pub fn from_notification(entity: &NotificationEntity, resource: Option<&str>) -> Self {
		Self {
			id: entity.id,
			remote_id: entity.remote_id.clone(),
			resource: resource.map(str::to_string),
			..Default::default()
		}
	}

	/// Placeholder for a parent we only know by id
	pub fn placeholder(id: Option<Id>, resource: Option<&str>) -> Self {
		Self {
			id: id.unwrap_or(-1),
			resource: resource.map(str::to_string),
			..Default::default()
		}
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionStatistics {
	pub count: i64,
	pub unread: i64,
	pub size: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
	pub id: Id,
	#[serde(default)]
	pub parent: Option<Id>,
	#[serde(default)]
	pub remote_id: Option<String>,
	#[serde(default)]
	pub remote_revision: Option<String>,
	#[serde(default)]
	pub mime_type: Option<String>,
	#[serde(default)]
	pub flags: BTreeSet<String>,
	/// Payload parts keyed by part name (without the `PLD:` prefix)
	#[serde(default)]
	pub payload: BTreeMap<String, String>,
	/// Attributes keyed by attribute name (without the `ATR:` prefix)
	#[serde(default)]
	pub attributes: BTreeMap<String, String>,
}

impl Item {
	pub fn new(id: Id) -> Self {
		Self { id, ..Default::default() }
	}

	pub fn with_parent(mut self, parent: Id) -> Self {
		self.parent = Some(parent);
		self
	}

	pub fn with_mime_type(mut self, mime_type: &str) -> Self {
		self.mime_type = Some(mime_type.to_string());
		self
	}

	pub fn with_payload(mut self, part: &str, value: &str) -> Self {
		self.payload.insert(part.to_string(), value.to_string());
		self
	}

	pub fn with_flag(mut self, flag: &str) -> Self {
		self.flags.insert(flag.to_string());
		self
	}

	/// Minimal item rebuilt from what a notification carries
	pub fn from_notification(entity: &NotificationEntity) -> Self {
		Self {
			id: entity.id,
			remote_id: entity.remote_id.clone(),
			remote_revision: entity.remote_revision.clone(),
			mime_type: entity.mime_type.clone(),
			..Default::default()
		}
	}

	/// Restrict the item to what `scope` asks for
	pub fn project(&self, scope: &ItemFetchScope) -> Self {
		let mut item = self.clone();
		if !scope.full_payload {
			item.payload.retain(|part, _| scope.payload_parts.contains(part));
		}
		if !scope.all_attributes {
			item.attributes.retain(|name, _| scope.attributes.contains(name));
		}
		item
	}
}

impl CacheEntity for Item {
	type Scope = ItemFetchScope;
	const KIND: EntityKind = EntityKind::Item;

	fn id(&self) -> Id {
		self.id
	}

	fn parent(&self) -> Option<Id> {
		self.parent
	}

	/// Incoming data wins, but parts the incoming fetch did not cover are kept
	fn merge(existing: &mut Self, incoming: Self) {
		let mut payload = std::mem::take(&mut existing.payload);
		let mut attributes = std::mem::take(&mut existing.attributes);
		payload.extend(incoming.payload.clone());
		attributes.extend(incoming.attributes.clone());
		*existing = Item { payload, attributes, ..incoming };
	}
}

impl CacheEntity for Collection {
	type Scope = CollectionFetchScope;
	const KIND: EntityKind = EntityKind::Collection;

	fn id(&self) -> Id {
		self.id
	}

	fn parent(&self) -> Option<Id> {
		self.parent
	}

	fn merge(existing: &mut Self, incoming: Self) {
		let statistics = incoming.statistics.or(existing.statistics);
		*existing = Collection { statistics, ..incoming };
	}
}

/// What to retrieve when fetching an item
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemFetchScope {
	#[serde(default)]
	pub full_payload: bool,
	#[serde(default)]
	pub payload_parts: BTreeSet<String>,
	#[serde(default)]
	pub all_attributes: bool,
	#[serde(default)]
	pub attributes: BTreeSet<String>,
	#[serde(default)]
	pub flags: bool,
}

impl ItemFetchScope {
	pub fn full() -> Self {
		Self { full_payload: true, all_attributes: true, flags: true, ..Default::default() }
	}

	pub fn with_payload_part(mut self, part: &str) -> Self {
		self.payload_parts.insert(part.to_string());
		self
	}

	/// Narrow this scope to the parts a modification reported as changed.
	///
	/// Payload parts arrive as `PLD:<name>`, attributes as `ATR:<name>`. Only
	/// parts this scope would have fetched anyway are kept.
	pub fn narrowed_to(&self, changed_parts: &BTreeSet<String>) -> Self {
		let mut scope = Self { flags: self.flags, ..Default::default() };
		for part in changed_parts {
			if let Some(name) = part.strip_prefix("PLD:") {
				if self.full_payload || self.payload_parts.contains(name) {
					scope.payload_parts.insert(name.to_string());
				}
			} else if let Some(name) = part.strip_prefix("ATR:") {
				if self.all_attributes || self.attributes.contains(name) {
					scope.attributes.insert(name.to_string());
				}
			}
		}
		scope
	}
}

impl FetchScope for ItemFetchScope {
	fn covers(&self, requested: &Self) -> bool {
		(self.full_payload || !requested.full_payload)
			&& (self.full_payload || requested.payload_parts.is_subset(&self.payload_parts))
			&& (self.all_attributes || !requested.all_attributes)
			&& (self.all_attributes || requested.attributes.is_subset(&self.attributes))
			&& (self.flags || !requested.flags)
	}

	fn is_empty(&self) -> bool {
		!self.full_payload
			&& self.payload_parts.is_empty()
			&& !self.all_attributes
			&& self.attributes.is_empty()
			&& !self.flags
	}
}

/// What to retrieve when fetching a collection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionFetchScope {
	#[serde(default)]
	pub include_statistics: bool,
	#[serde(default)]
	pub all_attributes: bool,
}

impl FetchScope for CollectionFetchScope {
	fn covers(&self, requested: &Self) -> bool {
		(self.include_statistics || !requested.include_statistics)
			&& (self.all_attributes || !requested.all_attributes)
	}

	fn is_empty(&self) -> bool {
		false
	}
}
