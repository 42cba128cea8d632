//! Decides which raw notifications are relevant to the observer
//!
//! Everything here is a pure function of the notification, the watch
//! configuration and (in reference tracking mode) the reference state.
//! Rejections are expected and never reported as errors.

use crate::config::WatchConfiguration;
use crate::entities::Id;
use crate::events::EventInterest;
use crate::notification::{ChangeNotification, EntityKind, Operation};
use crate::reference::ReferenceTracker;

/// Acceptance against the watch configuration alone
pub fn accept(notification: &ChangeNotification, watch: &WatchConfiguration) -> bool {
	// an observer never sees its own writes echoed back
	if watch.is_session_ignored(notification.session.as_ref()) {
		return false;
	}

	if notification.entities.is_empty() {
		return false;
	}

	if watch.monitor_all {
		return true;
	}

	if !watch.is_kind_watched(notification.kind) {
		return false;
	}

	match notification.kind {
		EntityKind::Item => accept_item(notification, watch),
		EntityKind::Collection => accept_collection(notification, watch),
	}
}

fn accept_item(notification: &ChangeNotification, watch: &WatchConfiguration) -> bool {
	if !watch.resources.is_empty() || !watch.mime_types.is_empty() {
		return resource_matches(notification, watch)
			|| notification
				.entities
				.iter()
				.any(|e| watch.is_mime_type_watched(e.mime_type.as_deref()));
	}

	notification.ids().any(|id| watch.is_item_watched(id))
		|| parent_watched(notification, watch)
}

fn accept_collection(notification: &ChangeNotification, watch: &WatchConfiguration) -> bool {
	if !watch.resources.is_empty() {
		let matches = resource_matches(notification, watch);
		if watch.mime_types.is_empty() || matches {
			return matches;
		}
	}

	notification.ids().any(|id| watch.is_collection_watched(id))
		|| parent_watched(notification, watch)
}

fn resource_matches(notification: &ChangeNotification, watch: &WatchConfiguration) -> bool {
	watch.is_resource_watched(notification.resource.as_deref())
		|| (notification.is_move()
			&& watch.is_resource_watched(notification.destination_resource.as_deref()))
}

fn parent_watched(notification: &ChangeNotification, watch: &WatchConfiguration) -> bool {
	let watched = |id: Option<Id>| id.is_some_and(|id| watch.is_collection_watched(id));
	watched(notification.parent) || (notification.is_move() && watched(notification.destination))
}

/// Full acceptance check: watch configuration, registered interests and
/// reference state.
#[derive(Debug, Clone, Copy)]
pub struct NotificationFilter<'a> {
	watch: &'a WatchConfiguration,
	references: Option<&'a ReferenceTracker>,
	statistics_wanted: bool,
}

impl<'a> NotificationFilter<'a> {
	pub fn new(watch: &'a WatchConfiguration) -> Self {
		Self { watch, references: None, statistics_wanted: false }
	}

	/// Enable reference tracking: item notifications only pass for referenced
	/// or buffered collections.
	pub fn with_references(mut self, references: &'a ReferenceTracker) -> Self {
		self.references = Some(references);
		self
	}

	/// Statistics are fetched from item notifications, so nothing may be
	/// skipped for lack of interest.
	pub fn with_statistics(mut self, wanted: bool) -> Self {
		self.statistics_wanted = wanted;
		self
	}

	pub fn accept(&self, notification: &ChangeNotification) -> bool {
		!self.lazily_ignored(notification, false) && accept(notification, self.watch)
	}

	/// Cheap rejection for notifications nobody would see.
	///
	/// Never rejects what a registered interest could observe. With
	/// `allow_flags_conversion`, a flags change still counts as wanted if the
	/// observer listens to plain item changes.
	pub fn lazily_ignored(&self, notification: &ChangeNotification, allow_flags_conversion: bool) -> bool {
		if self.uninteresting(notification, allow_flags_conversion) {
			return true;
		}

		let Some(references) = self.references else {
			return false;
		};

		// only item population is reference counted
		if notification.kind == EntityKind::Collection {
			return false;
		}

		let monitored = |id: Option<Id>| id.is_some_and(|id| references.is_monitored(id));
		match notification.operation {
			// both endpoints need inspection before the move can be rewritten
			Operation::Move => !monitored(notification.parent) && !monitored(notification.destination),
			Operation::Subscribe | Operation::Unsubscribe => true,
			_ => !monitored(notification.parent),
		}
	}

	fn uninteresting(&self, notification: &ChangeNotification, allow_flags_conversion: bool) -> bool {
		if self.watch.monitor_all || self.statistics_wanted {
			return false;
		}
		if notification.kind != EntityKind::Item {
			return false;
		}

		let interests = &self.watch.interests;
		match notification.operation {
			Operation::Add => !interests.contains(EventInterest::ItemAdded),
			Operation::Modify => !interests.contains(EventInterest::ItemChanged),
			Operation::ModifyFlags => {
				!interests.contains(EventInterest::ItemsFlagsChanged)
					&& (!allow_flags_conversion || !interests.contains(EventInterest::ItemChanged))
			}
			Operation::Move => !interests.contains(EventInterest::ItemsMoved),
			Operation::Remove => !interests.contains(EventInterest::ItemsRemoved),
			Operation::Link => !interests.contains(EventInterest::ItemsLinked),
			Operation::Unlink => !interests.contains(EventInterest::ItemsUnlinked),
			Operation::Subscribe | Operation::Unsubscribe => false,
		}
	}
}
