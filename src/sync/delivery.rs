use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::DeliveryError;
use crate::models::{ItemId, now_ms};

/// Hands one queued payload to the remote service.
///
/// `Ok(())` is a positive acknowledgement; the item is removed from the
/// queue only then. `id` is stable across retries and may be used by the
/// remote side to drop duplicates.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn submit(&self, id: ItemId, payload: &Value) -> Result<(), DeliveryError>;
}

/// Appends delivered items to an NDJSON journal file.
pub struct JournalDelivery {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JournalDelivery {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Delivery for JournalDelivery {
    async fn submit(&self, id: ItemId, payload: &Value) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(&json!({
            "id": id,
            "delivered_at": now_ms(),
            "payload": payload,
        }))
        .map_err(|e| DeliveryError::Permanent(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        info!(%id, journal = %self.path.display(), "item delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn journal_appends_one_line_per_item() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("delivered.ndjson");
        let delivery = JournalDelivery::new(&path);

        let first = ItemId::new();
        delivery.submit(first, &json!({"caption": "a"})).await?;
        delivery.submit(ItemId::new(), &json!({"caption": "b"})).await?;

        let content = tokio::fs::read_to_string(&path).await?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], json!(first));
        assert_eq!(lines[1]["payload"]["caption"], "b");
        Ok(())
    }
}
