//! Bounded entity cache with asynchronous fill
//!
//! # Module Organization
//!
//! - [`entity_cache`] - The generic [`EntityCache`] and its entries
//!
//! The cache is generic over a [`CacheEntity`]. Fetching is delegated to an
//! [`EntityFetcher`] collaborator; every finished fetch comes back to the
//! controlling task as a [`FetchCompletion`] and acts as a global
//! "data available" pulse for the pipeline.

pub mod entity_cache;

use crate::entities::Id;
use crate::error::Result;
use crate::notification::EntityKind;
use std::fmt::Debug;

pub use entity_cache::{CacheEntry, EntityCache};

/// Describes which parts of an entity a fetch retrieves
pub trait FetchScope: Clone + Debug + PartialEq + Send + Sync + 'static {
	/// Whether data fetched with `self` satisfies a request for `requested`
	fn covers(&self, requested: &Self) -> bool;

	/// An empty scope means "do not fetch this kind at all"
	fn is_empty(&self) -> bool;
}

/// An entity kind the cache can hold
pub trait CacheEntity: Clone + Debug + Send + Sync + 'static {
	type Scope: FetchScope;
	const KIND: EntityKind;

	fn id(&self) -> Id;

	/// Parent collection, used to purge a collection's children
	fn parent(&self) -> Option<Id>;

	/// Fold a freshly fetched copy into the one already held
	fn merge(existing: &mut Self, incoming: Self);
}

/// Remote fetch collaborator for one entity kind
#[async_trait::async_trait]
pub trait EntityFetcher<T: CacheEntity>: Send + Sync {
	/// Fetch `id` with `scope`. `Ok(None)` means the entity no longer exists.
	async fn fetch(&self, id: Id, scope: &T::Scope) -> Result<Option<T>>;
}

/// Result of one outstanding fetch, delivered back to the controlling task
#[derive(Debug)]
pub struct FetchCompletion<T: CacheEntity> {
	pub id: Id,
	pub token: u64,
	pub result: Result<Option<T>>,
}
