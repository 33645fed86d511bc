//! Durable queue store.
//!
//! A thin schema over a [`KvStore`]: each item lives under
//! `item/<20-digit sequence>` so that key order is enqueue order. All
//! mutations and reads go through one async mutex, which makes them atomic
//! with respect to each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::KvStore;
use crate::error::QueueError;
use crate::models::{ItemId, ItemStatus, QueueItem};

const KEY_PREFIX: &str = "item/";

/// On-disk shape of a queue item. Unknown fields are ignored on read.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    id: ItemId,
    payload: Value,
    created_at: i64,
    #[serde(default)]
    attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl Record {
    fn from_item(item: &QueueItem) -> Self {
        Self {
            id: item.id,
            payload: item.payload.clone(),
            created_at: item.created_at,
            attempt_count: item.attempt_count,
            failure: item.failure_reason().map(str::to_string),
        }
    }

    fn into_item(self) -> QueueItem {
        QueueItem {
            id: self.id,
            payload: self.payload,
            created_at: self.created_at,
            attempt_count: self.attempt_count,
            status: match self.failure {
                Some(reason) => ItemStatus::Failed(reason),
                None => ItemStatus::Pending,
            },
        }
    }
}

#[derive(Default)]
struct Index {
    keys: HashMap<ItemId, String>,
    corrupt: HashSet<String>,
    next_seq: u64,
}

pub struct QueueStore {
    kv: Arc<dyn KvStore>,
    index: Mutex<Index>,
}

impl QueueStore {
    /// Load the index from `kv`. Corrupt records are logged and skipped.
    pub async fn open(kv: Arc<dyn KvStore>) -> Result<Self, QueueError> {
        let mut index = Index::default();
        for key in kv.list_keys(KEY_PREFIX).await? {
            if let Some(seq) = parse_seq(&key) {
                index.next_seq = index.next_seq.max(seq.saturating_add(1));
            }
            match read_record(kv.as_ref(), &key).await {
                Ok(Some(record)) => {
                    index.keys.insert(record.id, key);
                }
                Ok(None) => {}
                Err(QueueError::StorageCorrupt { record_id }) => {
                    warn!(record = %record_id, "skipping corrupt queue record");
                    index.corrupt.insert(record_id);
                }
                Err(e) => return Err(e),
            }
        }
        debug!(items = index.keys.len(), corrupt = index.corrupt.len(), "queue store loaded");
        Ok(Self {
            kv,
            index: Mutex::new(index),
        })
    }

    /// Persist a new item at the tail of the queue.
    pub async fn append(&self, item: &QueueItem) -> Result<(), QueueError> {
        let mut index = self.index.lock().await;
        if index.keys.contains_key(&item.id) {
            return Err(QueueError::DuplicateItem(item.id));
        }
        let seq = index.next_seq;
        // A key at the very end of the sequence space leaves no room to append.
        let next_seq = seq.checked_add(1).ok_or(QueueError::StorageFull)?;
        let key = format!("{KEY_PREFIX}{seq:020}");
        let bytes = serde_json::to_vec(&Record::from_item(item))?;
        self.kv.put(&key, &bytes).await?;
        index.next_seq = next_seq;
        index.keys.insert(item.id, key);
        Ok(())
    }

    /// Every readable item in enqueue order.
    pub async fn list_all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut index = self.index.lock().await;
        let mut items = Vec::with_capacity(index.keys.len());
        for key in self.kv.list_keys(KEY_PREFIX).await? {
            if index.corrupt.contains(&key) {
                continue;
            }
            match read_record(self.kv.as_ref(), &key).await {
                Ok(Some(record)) => items.push(record.into_item()),
                Ok(None) => {}
                Err(QueueError::StorageCorrupt { record_id }) => {
                    warn!(record = %record_id, "skipping corrupt queue record");
                    index.corrupt.insert(record_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    pub async fn get(&self, id: ItemId) -> Result<Option<QueueItem>, QueueError> {
        let index = self.index.lock().await;
        let Some(key) = index.keys.get(&id) else {
            return Ok(None);
        };
        Ok(read_record(self.kv.as_ref(), key)
            .await?
            .map(Record::into_item))
    }

    /// Remove an item. Removing an unknown id is a no-op that returns `false`.
    pub async fn remove(&self, id: ItemId) -> Result<bool, QueueError> {
        let mut index = self.index.lock().await;
        let Some(key) = index.keys.get(&id).cloned() else {
            return Ok(false);
        };
        self.kv.delete(&key).await?;
        index.keys.remove(&id);
        Ok(true)
    }

    /// Overwrite the stored copy of an item that is still queued.
    ///
    /// Returns `false` without writing when the item is no longer present,
    /// so a late update cannot bring back a removed or cleared item.
    pub async fn replace(&self, item: &QueueItem) -> Result<bool, QueueError> {
        let index = self.index.lock().await;
        let Some(key) = index.keys.get(&item.id) else {
            return Ok(false);
        };
        let bytes = serde_json::to_vec(&Record::from_item(item))?;
        self.kv.put(key, &bytes).await?;
        Ok(true)
    }

    /// Delete every record, including ones that failed to decode.
    ///
    /// On a storage error the index keeps exactly the records still stored.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut index = self.index.lock().await;
        let mut deleted = HashSet::new();
        for key in self.kv.list_keys(KEY_PREFIX).await? {
            if let Err(e) = self.kv.delete(&key).await {
                index.keys.retain(|_, k| !deleted.contains(k));
                index.corrupt.retain(|k| !deleted.contains(k));
                return Err(e);
            }
            deleted.insert(key);
        }
        *index = Index::default();
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn parse_seq(key: &str) -> Option<u64> {
    key.strip_prefix(KEY_PREFIX)?.parse().ok()
}

async fn read_record(kv: &dyn KvStore, key: &str) -> Result<Option<Record>, QueueError> {
    let Some(bytes) = kv.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|_| QueueError::StorageCorrupt {
            record_id: key.to_string(),
        })
}
