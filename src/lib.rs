pub mod cache;
pub mod change_log;
pub mod config;
pub mod entities;
mod error;
pub mod events;
pub mod filter;
pub mod memory_store;
mod monitor;
pub mod notification;
pub mod pipeline;
pub mod reference;
pub mod retry;
pub mod statistics;
pub mod stats;

pub use cache::{EntityCache, EntityFetcher};
pub use change_log::ItemChanges;
pub use config::{MonitorConfig, WatchConfiguration};
pub use entities::{Collection, CollectionFetchScope, CollectionStatistics, Id, Item, ItemFetchScope};
pub use error::{ErrorRecoveryConfig, MonitorError, Result};
pub use events::{EventInterest, InterestSet, MonitorEvent};
pub use memory_store::{MemoryStore, StoreSnapshot};
pub use monitor::{start, Completions, Monitor, MonitorCommand, MonitorHandle, NotificationSender};
pub use notification::{ChangeNotification, EntityKind, NotificationEntity, Operation, SessionId};
pub use stats::PipelineStats;
pub use statistics::StatisticsFetcher;
