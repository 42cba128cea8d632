use crate::entities::Id;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Accumulated changes for a single item since they were last taken
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemChanges {
	pub added_flags: BTreeSet<String>,
	pub removed_flags: BTreeSet<String>,
	pub parts: BTreeSet<String>,
}

impl ItemChanges {
	pub fn is_empty(&self) -> bool {
		self.added_flags.is_empty() && self.removed_flags.is_empty() && self.parts.is_empty()
	}
}

/// Per-item side table of emitted changes, keyed by item id
#[derive(Debug, Default)]
pub struct ChangeLog {
	entries: HashMap<Id, ItemChanges>,
}

impl ChangeLog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_parts<'a, I>(&mut self, item: Id, parts: I)
	where I: IntoIterator<Item = &'a String> {
		let changes = self.entries.entry(item).or_default();
		changes.parts.extend(parts.into_iter().cloned());
	}

	/// A flag added and later removed (or vice versa) cancels out
	pub fn record_flags(&mut self, item: Id, added: &BTreeSet<String>, removed: &BTreeSet<String>) {
		let changes = self.entries.entry(item).or_default();
		for flag in added {
			if !changes.removed_flags.remove(flag) {
				changes.added_flags.insert(flag.clone());
			}
		}
		for flag in removed {
			if !changes.added_flags.remove(flag) {
				changes.removed_flags.insert(flag.clone());
			}
		}
		if changes.is_empty() {
			self.entries.remove(&item);
		}
	}

	pub fn forget(&mut self, item: Id) {
		self.entries.remove(&item);
	}

	pub fn take(&mut self, item: Id) -> Option<ItemChanges> {
		self.entries.remove(&item)
	}

	pub fn get(&self, item: Id) -> Option<&ItemChanges> {
		self.entries.get(&item)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn flags(names: &[&str]) -> BTreeSet<String> {
		names.iter().map(|s| s.to_string()).collect()
	}

	#[test]
	fn test_changes_accumulate_per_item() {
		let mut log = ChangeLog::new();
		log.record_parts(1, &flags(&["PLD:HEAD"]));
		log.record_parts(1, &flags(&["PLD:BODY"]));
		log.record_flags(2, &flags(&["\\Seen"]), &flags(&[]));

		let first = log.take(1).unwrap();
		assert_eq!(first.parts, flags(&["PLD:BODY", "PLD:HEAD"]));
		assert!(log.take(1).is_none());
		assert!(log.get(2).unwrap().added_flags.contains("\\Seen"));
	}

	#[test]
	fn test_opposite_flag_changes_cancel() {
		let mut log = ChangeLog::new();
		log.record_flags(1, &flags(&["\\Seen"]), &flags(&[]));
		log.record_flags(1, &flags(&[]), &flags(&["\\Seen"]));
		assert!(log.is_empty());
	}

	#[test]
	fn test_forget_removed_item() {
		let mut log = ChangeLog::new();
		log.record_parts(1, &flags(&["FLAGS"]));
		log.forget(1);
		assert!(log.get(1).is_none());
	}
}
