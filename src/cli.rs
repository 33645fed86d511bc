use crate::connectivity::ConnectivityMonitor;
use crate::models::{EngineState, ItemId, PostDraft, QueueItem, now_ms};
use crate::queue::{Config, OfflineQueue};
use crate::server;
use crate::sync::{Delivery, JournalDelivery, SyncConfig};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Postbox CLI interface
#[derive(Parser, Debug)]
#[command(name = "postbox", about = "Offline-first delivery queue")]
pub struct Cli {
    #[command(flatten)]
    pub options: GlobalOptions,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOptions {
    /// SQLite database holding the queue
    #[arg(long, global = true, env = "POSTBOX_DB")]
    pub db: Option<PathBuf>,
    /// NDJSON file delivered items are appended to
    #[arg(long, global = true, env = "POSTBOX_JOURNAL", default_value = "delivered.ndjson")]
    pub journal: PathBuf,
    /// Per-attempt delivery timeout in ms
    #[arg(long, global = true, default_value_t = 30_000)]
    pub timeout_ms: u64,
    /// First retry delay in ms
    #[arg(long, global = true, default_value_t = 2_000)]
    pub backoff_base_ms: u64,
    /// Longest retry delay in ms
    #[arg(long, global = true, default_value_t = 300_000)]
    pub backoff_max_ms: u64,
    /// Treat the network as unreachable: queue without delivering
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8888)]
        port: u16,
    },
    /// Queue a post (or any JSON payload with --payload)
    Enqueue {
        #[arg(long, default_value = "")]
        image: String,
        #[arg(long, default_value = "")]
        caption: String,
        #[arg(long, default_value = "")]
        location: String,
        /// Inline JSON payload, replaces the post fields
        #[arg(long)]
        payload: Option<String>,
    },
    /// List queued items
    List,
    /// Run one drain pass and wait for it to finish
    Sync,
    /// Put a failed item back in line
    Requeue {
        /// Item ID
        id: ItemId,
    },
    /// Discard every queued item
    Clear,
}

impl GlobalOptions {
    fn config(&self) -> Config {
        let mut cfg = Config::default();
        if let Some(db) = &self.db {
            cfg.db_path = db.clone();
        }
        cfg.sync = SyncConfig {
            attempt_timeout: Duration::from_millis(self.timeout_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            // One-shot commands decide themselves whether to drain.
            sync_on_start: false,
        };
        cfg
    }

    fn delivery(&self) -> Arc<dyn Delivery> {
        Arc::new(JournalDelivery::new(&self.journal))
    }

    async fn open_queue(&self) -> anyhow::Result<OfflineQueue> {
        // One-shot commands have no host signal; --offline stands in for it.
        let monitor = ConnectivityMonitor::new((!self.offline).into());
        OfflineQueue::open_sqlite(&self.config(), self.delivery(), monitor)
            .await
            .context("Failed to open queue")
    }
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let options = self.options;
        match self.command {
            Commands::Serve { port } => {
                let mut cfg = options.config();
                cfg.sync.sync_on_start = true;
                server::run_server(port, cfg, options.delivery()).await?;
            }
            Commands::Enqueue { image, caption, location, payload } => {
                let value: Value = match payload {
                    Some(raw) => serde_json::from_str(&raw)
                        .context("Invalid JSON payload")?,
                    None => serde_json::to_value(PostDraft { image, caption, location })?,
                };
                let queue = options.open_queue().await?;
                let id = queue.enqueue(&value).await.context("Error enqueueing item")?;
                queue.settled().await;
                println!("Queued {}", id);
            }
            Commands::List => {
                let queue = options.open_queue().await?;
                let items = queue.pending().await.context("Error listing queue")?;
                print_items(&items);
            }
            Commands::Sync => {
                let queue = options.open_queue().await?;
                let before = queue.pending().await?.len();
                if !queue.trigger_sync() {
                    println!("Sync already in progress");
                }
                let state = queue.settled().await;
                let after = queue.pending().await?;
                println!(
                    "Delivered {} item(s), {} remaining",
                    before.saturating_sub(after.len()),
                    after.len()
                );
                if state == EngineState::Backoff {
                    println!("Some deliveries failed and will be retried");
                }
            }
            Commands::Requeue { id } => {
                let queue = options.open_queue().await?;
                if queue.requeue(id).await.context("Error requeueing item")? {
                    queue.settled().await;
                    println!("Requeued {}", id);
                } else {
                    println!("Item {} has not failed", id);
                }
            }
            Commands::Clear => {
                let queue = options.open_queue().await?;
                queue.clear().await.context("Error clearing queue")?;
                println!("Cleared queue");
            }
        }
        Ok(())
    }
}

fn print_items(items: &[QueueItem]) {
    if items.is_empty() {
        println!("Queue is empty");
        return;
    }
    let now = now_ms();
    println!("{:<38} {:<10} {:<9} {}", "ID", "QUEUED", "ATTEMPTS", "STATUS");
    for item in items {
        let status = match item.failure_reason() {
            Some(reason) => format!("failed: {reason}"),
            None => "pending".to_string(),
        };
        println!(
            "{:<38} {:<10} {:<9} {}",
            item.id,
            age_label(item.age(now)),
            item.attempt_count,
            status
        );
    }
}

/// Short "queued 3m ago" style label.
pub fn age_label(age: Duration) -> String {
    let secs = age.as_secs();
    match secs {
        0..60 => "just now".to_string(),
        60..3_600 => format!("{}m ago", secs / 60),
        3_600..86_400 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_labels() {
        assert_eq!(age_label(Duration::from_secs(5)), "just now");
        assert_eq!(age_label(Duration::from_secs(180)), "3m ago");
        assert_eq!(age_label(Duration::from_secs(7_200)), "2h ago");
        assert_eq!(age_label(Duration::from_secs(3 * 86_400)), "3d ago");
    }
}
