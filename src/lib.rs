//! Offline-first delivery queue.
//!
//! Content is queued durably while the network is unreachable and delivered
//! once per item, in enqueue order, when connectivity returns or a sync is
//! requested. See [`queue::OfflineQueue`] for the entry point.

pub mod cli;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod server;
pub mod store;
pub mod sync;

pub use connectivity::{ConnectivityMonitor, Subscription};
pub use error::{DeliveryError, QueueError};
pub use models::{Connectivity, EngineState, ItemId, ItemStatus, QueueItem, SyncEvent};
pub use queue::OfflineQueue;
pub use sync::{Delivery, SyncConfig, SyncEngine};
