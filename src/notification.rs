//! Raw change notifications as they arrive from the store

use crate::entities::Id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Part name used when a flags change is reported as a regular modification
pub const FLAGS_PART: &str = "FLAGS";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operation {
	Add,
	Modify,
	ModifyFlags,
	Move,
	Remove,
	Link,
	Unlink,
	Subscribe,
	Unsubscribe,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
	Item,
	Collection,
}

/// Identifier of the client session that caused a change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// One entity touched by a notification, with the little we know about it
/// without asking the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEntity {
	pub id: Id,
	#[serde(default)]
	pub remote_id: Option<String>,
	#[serde(default)]
	pub remote_revision: Option<String>,
	#[serde(default)]
	pub mime_type: Option<String>,
}

impl NotificationEntity {
	pub fn new(id: Id) -> Self {
		Self { id, remote_id: None, remote_revision: None, mime_type: None }
	}
}

/// A raw change notification as pushed by the transport.
///
/// Notifications are treated as immutable. The pipeline may rewrite the
/// operation and parent fields once, before the notification is queued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeNotification {
	pub operation: Operation,
	pub kind: EntityKind,
	pub entities: Vec<NotificationEntity>,
	/// Source parent collection
	#[serde(default)]
	pub parent: Option<Id>,
	/// Destination parent collection, only set for moves
	#[serde(default)]
	pub destination: Option<Id>,
	#[serde(default)]
	pub resource: Option<String>,
	#[serde(default)]
	pub destination_resource: Option<String>,
	#[serde(default)]
	pub session: Option<SessionId>,
	/// Changed parts (payload parts are prefixed `PLD:`, attributes `ATR:`)
	#[serde(default)]
	pub parts: BTreeSet<String>,
	#[serde(default)]
	pub added_flags: BTreeSet<String>,
	#[serde(default)]
	pub removed_flags: BTreeSet<String>,
}

impl ChangeNotification {
	pub fn new(kind: EntityKind, operation: Operation) -> Self {
		Self {
			operation,
			kind,
			entities: Vec::new(),
			parent: None,
			destination: None,
			resource: None,
			destination_resource: None,
			session: None,
			parts: BTreeSet::new(),
			added_flags: BTreeSet::new(),
			removed_flags: BTreeSet::new(),
		}
	}

	pub fn item(operation: Operation, id: Id) -> Self {
		Self::new(EntityKind::Item, operation).with_entity(id)
	}

	pub fn collection(operation: Operation, id: Id) -> Self {
		Self::new(EntityKind::Collection, operation).with_entity(id)
	}

	pub fn with_entity(mut self, id: Id) -> Self {
		self.entities.push(NotificationEntity::new(id));
		self
	}

	pub fn with_entity_details(mut self, entity: NotificationEntity) -> Self {
		self.entities.push(entity);
		self
	}

	pub fn in_collection(mut self, parent: Id) -> Self {
		self.parent = Some(parent);
		self
	}

	pub fn moved_to(mut self, destination: Id) -> Self {
		self.destination = Some(destination);
		self
	}

	pub fn from_resource(mut self, resource: &str) -> Self {
		self.resource = Some(resource.to_string());
		self
	}

	pub fn to_resource(mut self, resource: &str) -> Self {
		self.destination_resource = Some(resource.to_string());
		self
	}

	pub fn from_session(mut self, session: SessionId) -> Self {
		self.session = Some(session);
		self
	}

	pub fn with_parts<I, S>(mut self, parts: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.parts.extend(parts.into_iter().map(Into::into));
		self
	}

	pub fn with_flags<A, R, S>(mut self, added: A, removed: R) -> Self
	where
		A: IntoIterator<Item = S>,
		R: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.added_flags.extend(added.into_iter().map(Into::into));
		self.removed_flags.extend(removed.into_iter().map(Into::into));
		self
	}

	/// Ids of all affected entities, in notification order
	pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
		self.entities.iter().map(|e| e.id)
	}

	pub fn is_move(&self) -> bool {
		self.operation == Operation::Move
	}

	pub fn involves(&self, id: Id) -> bool {
		self.entities.iter().any(|e| e.id == id)
	}

	/// Rewrite a move into a removal from its source collection
	pub fn into_removal(mut self) -> Self {
		self.operation = Operation::Remove;
		self.destination = None;
		self.destination_resource = None;
		self
	}

	/// Rewrite a move into insertions into its destination collection,
	/// one notification per entity
	pub fn into_insertions(mut self) -> Vec<Self> {
		self.operation = Operation::Add;
		self.parent = self.destination.take();
		if let Some(resource) = self.destination_resource.take() {
			self.resource = Some(resource);
		}
		self.split()
	}

	/// Split into one notification per entity
	pub fn split(self) -> Vec<Self> {
		if self.entities.len() <= 1 {
			return vec![self];
		}
		let mut base = self;
		let entities = std::mem::take(&mut base.entities);
		entities
			.into_iter()
			.map(|entity| {
				let mut single = base.clone();
				single.entities.push(entity);
				single
			})
			.collect()
	}

	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}
}
