//! Queue façade: the only entry point for producers and renderers.

use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::db::{self, KvStore, SqliteKv};
use crate::error::QueueError;
use crate::models::{
    EngineState, ItemId, ItemStatus, QueueItem, QueueStatus, SyncEvent, Trigger,
};
use crate::store::QueueStore;
use crate::sync::{Delivery, SyncConfig, SyncEngine};
use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Configuration for queue/database setup
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub force_recreate: bool,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        let cwd =
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            db_path: cwd.join("postbox.db"),
            force_recreate: false,
            sync: SyncConfig::default(),
        }
    }
}

/// Initialize the pool, ensuring the database exists first.
pub async fn init_pool(cfg: &Config) -> Result<SqlitePool> {
    db::create_db_if_needed_at(&cfg.db_path, cfg.force_recreate).await?;
    let pool = db::init_pool_at(&cfg.db_path).await?;
    Ok(pool)
}

/// Offline-first delivery queue.
///
/// Producers enqueue content at any time; the sync engine delivers it when
/// the monitor reports the network reachable. Dropping the queue removes
/// its connectivity subscription.
pub struct OfflineQueue {
    store: Arc<QueueStore>,
    engine: SyncEngine,
    monitor: ConnectivityMonitor,
    _subscription: Subscription,
}

impl OfflineQueue {
    /// Rehydrate the queue from `kv` and wire the engine to `monitor`.
    pub async fn open(
        kv: Arc<dyn KvStore>,
        delivery: Arc<dyn Delivery>,
        monitor: ConnectivityMonitor,
        config: &SyncConfig,
    ) -> Result<Self, QueueError> {
        let store = Arc::new(QueueStore::open(kv).await?);
        let engine =
            SyncEngine::new(store.clone(), delivery, monitor.clone(), config);

        let on_change = engine.clone();
        let subscription = monitor.subscribe(move |status| {
            if status.is_online() {
                on_change.trigger(Trigger::ConnectivityRestored);
            }
        });

        let queue = Self {
            store,
            engine,
            monitor,
            _subscription: subscription,
        };
        let waiting = queue.store.len().await;
        info!(waiting, online = queue.monitor.is_online(), "offline queue opened");
        if config.sync_on_start && waiting > 0 && queue.monitor.is_online() {
            queue.engine.trigger(Trigger::Startup);
        }
        Ok(queue)
    }

    /// Open a queue persisted in the SQLite database named by `cfg`.
    pub async fn open_sqlite(
        cfg: &Config,
        delivery: Arc<dyn Delivery>,
        monitor: ConnectivityMonitor,
    ) -> Result<Self> {
        let pool = init_pool(cfg).await?;
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::new(pool));
        Ok(Self::open(kv, delivery, monitor, &cfg.sync).await?)
    }

    /// Durably queue `payload` and return its id.
    ///
    /// Fails with the store's error if the write is rejected; the content is
    /// not kept anywhere else in that case.
    pub async fn enqueue<P: Serialize + ?Sized>(
        &self,
        payload: &P,
    ) -> Result<ItemId, QueueError> {
        let item = QueueItem::new(serde_json::to_value(payload)?);
        self.store.append(&item).await?;
        debug!(id = %item.id, "item enqueued");
        if self.monitor.is_online() {
            self.engine.trigger(Trigger::Enqueued);
        }
        Ok(item.id)
    }

    /// Snapshot of every queued item in enqueue order, failed ones included.
    pub async fn pending(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut items = self.store.list_all().await?;
        for item in &mut items {
            if item.status == ItemStatus::Pending && self.engine.is_in_flight(item.id)
            {
                item.status = ItemStatus::InFlight;
            }
        }
        Ok(items)
    }

    /// Put a failed item back in line for automatic delivery.
    ///
    /// Its attempt count is kept. Returns `false` if the item was not failed.
    pub async fn requeue(&self, id: ItemId) -> Result<bool, QueueError> {
        let mut item =
            self.store.get(id).await?.ok_or(QueueError::UnknownItem(id))?;
        if !item.is_failed() {
            return Ok(false);
        }
        item.status = ItemStatus::Pending;
        if !self.store.replace(&item).await? {
            return Err(QueueError::UnknownItem(id));
        }
        info!(%id, attempts = item.attempt_count, "item requeued");
        if self.monitor.is_online() {
            self.engine.trigger(Trigger::Manual);
        }
        Ok(true)
    }

    /// Request a drain pass. No-op while draining or waiting out a backoff.
    pub fn trigger_sync(&self) -> bool {
        self.engine.trigger(Trigger::Manual)
    }

    /// Discard every queued item and any pending retry.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.engine.cancel();
        self.store.clear().await?;
        info!("offline queue cleared");
        Ok(())
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let items = self.pending().await?;
        let count = |wanted: fn(&ItemStatus) -> bool| {
            items.iter().filter(|i| wanted(&i.status)).count()
        };
        Ok(QueueStatus {
            connectivity: self.monitor.current_status(),
            engine: self.engine.state(),
            pending: count(|s| *s == ItemStatus::Pending),
            in_flight: count(|s| *s == ItemStatus::InFlight),
            failed: count(|s| matches!(s, ItemStatus::Failed(_))),
        })
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.engine.watch_state()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.events()
    }

    /// Wait for the running pass, if any, to finish.
    pub async fn settled(&self) -> EngineState {
        self.engine.settled().await
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.monitor
    }
}
