use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque identifier assigned to an item when it is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Delivery status of a queued item.
///
/// `InFlight` only ever exists in memory while an attempt is underway;
/// the store persists `Pending` and `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InFlight,
    Failed(String),
}

/// A unit of content waiting to be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    pub payload: Value,
    /// Enqueue time in milliseconds since the Unix epoch.
    pub created_at: i64,
    pub attempt_count: u32,
    pub status: ItemStatus,
}

impl QueueItem {
    pub fn new(payload: Value) -> Self {
        Self {
            id: ItemId::new(),
            payload,
            created_at: now_ms(),
            attempt_count: 0,
            status: ItemStatus::Pending,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ItemStatus::Failed(_))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            ItemStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// How long the item has been waiting, as seen at `now_ms`.
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.created_at).max(0) as u64)
    }
}

/// The content a user composes while offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub image: String,
    pub caption: String,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Draining,
    Backoff,
}

/// What asked the sync engine to start a drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    ConnectivityRestored,
    Manual,
    Enqueued,
    RetryTimer,
    Startup,
}

/// Progress notifications published by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    PassStarted {
        trigger: Trigger,
    },
    Delivered {
        id: ItemId,
    },
    AttemptFailed {
        id: ItemId,
        attempt_count: u32,
        reason: String,
        retryable: bool,
    },
    BackoffScheduled {
        delay_ms: u64,
    },
    PassFinished {
        delivered: usize,
        rejected: usize,
        retryable: usize,
    },
    Cleared,
}

/// Counts a renderer shows next to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub connectivity: Connectivity,
    pub engine: EngineState,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
