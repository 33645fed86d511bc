use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use postbox::db::{KvStore, MemoryKv};
use postbox::queue::OfflineQueue;
use postbox::server::app_router;
use postbox::{
    Connectivity, ConnectivityMonitor, Delivery, DeliveryError, EngineState, ItemId,
    QueueItem, SyncConfig,
};
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

/// Records every delivered id; optionally slow to widen race windows.
#[derive(Default)]
struct RecordingDelivery {
    delivered: Mutex<Vec<ItemId>>,
    delay: Duration,
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn submit(&self, id: ItemId, _payload: &Value) -> Result<(), DeliveryError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.delivered.lock().unwrap().push(id);
        Ok(())
    }
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        attempt_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        sync_on_start: false,
    }
}

async fn setup(
    kv: Arc<MemoryKv>,
    delivery: Arc<RecordingDelivery>,
    initial: Connectivity,
) -> anyhow::Result<(Arc<OfflineQueue>, axum::Router)> {
    let kv: Arc<dyn KvStore> = kv;
    let monitor = ConnectivityMonitor::new(initial);
    let queue = Arc::new(OfflineQueue::open(kv, delivery, monitor, &sync_config()).await?);
    let app = app_router(queue.clone());
    Ok((queue, app))
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> anyhow::Result<(StatusCode, Value)> {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&v)?)
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body)?).await?;
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    Ok((status, value))
}

#[tokio::test]
async fn concurrent_http_enqueues_are_each_delivered_once_in_order() -> anyhow::Result<()> {
    let delivery = Arc::new(RecordingDelivery::default());
    let (queue, app) =
        setup(Arc::new(MemoryKv::new()), delivery.clone(), Connectivity::Offline).await?;

    let mut handles = Vec::new();
    for n in 0..50 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let body = json!({ "payload": { "caption": format!("post {n}") } });
            send(&app, "POST", "/queue", Some(body)).await
        }));
    }
    let mut created = HashSet::new();
    for h in handles {
        let (status, body) = h.await??;
        assert_eq!(status, StatusCode::CREATED);
        let id: ItemId = body["id"].as_str().unwrap_or_default().parse()?;
        created.insert(id);
    }
    assert_eq!(created.len(), 50);

    let (status, body) = send(&app, "GET", "/queue", None).await?;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<QueueItem> = serde_json::from_value(body)?;
    assert_eq!(listed.len(), 50);
    let order: Vec<ItemId> = listed.iter().map(|i| i.id).collect();

    let (status, body) =
        send(&app, "PUT", "/connectivity", Some(json!({ "online": true }))).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(queue.settled().await, EngineState::Idle);

    let delivered = delivery.delivered.lock().unwrap().clone();
    assert_eq!(delivered, order);
    assert_eq!(delivered.iter().collect::<HashSet<_>>().len(), 50);
    assert!(queue.pending().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn enqueues_racing_an_active_drain_are_not_stranded() -> anyhow::Result<()> {
    let delivery = Arc::new(RecordingDelivery {
        delay: Duration::from_millis(2),
        ..Default::default()
    });
    let (queue, _app) =
        setup(Arc::new(MemoryKv::new()), delivery.clone(), Connectivity::Online).await?;

    let mut handles = Vec::new();
    for n in 0..40 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            if n % 4 == 0 {
                tokio::time::sleep(Duration::from_millis(n)).await;
            }
            queue.enqueue(&json!({ "n": n })).await
        }));
    }
    let mut ids = HashSet::new();
    for h in handles {
        ids.insert(h.await??);
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if queue.settled().await == EngineState::Idle && queue.pending().await?.is_empty() {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await??;

    let delivered = delivery.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 40, "every item delivered exactly once");
    assert_eq!(delivered.into_iter().collect::<HashSet<_>>(), ids);
    Ok(())
}

#[tokio::test]
async fn status_sync_and_clear_endpoints() -> anyhow::Result<()> {
    let delivery = Arc::new(RecordingDelivery::default());
    let (queue, app) =
        setup(Arc::new(MemoryKv::new()), delivery.clone(), Connectivity::Offline).await?;

    let (status, _) = send(&app, "GET", "/health", None).await?;
    assert_eq!(status, StatusCode::OK);

    for n in 0..3 {
        send(&app, "POST", "/queue", Some(json!({ "payload": { "n": n } }))).await?;
    }
    let (status, body) = send(&app, "GET", "/status", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connectivity"], "offline");
    assert_eq!(body["engine"], "idle");
    assert_eq!(body["pending"], 3);

    // Offline: the pass starts but attempts nothing.
    let (status, body) = send(&app, "POST", "/sync", None).await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["started"], true);
    queue.settled().await;
    assert!(delivery.delivered.lock().unwrap().is_empty());

    let (status, _) = send(&app, "DELETE", "/queue", None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send(&app, "GET", "/queue", None).await?;
    assert_eq!(body, json!([]));
    Ok(())
}

#[tokio::test]
async fn requeue_endpoint_validates_ids() -> anyhow::Result<()> {
    let delivery = Arc::new(RecordingDelivery::default());
    let (_queue, app) =
        setup(Arc::new(MemoryKv::new()), delivery, Connectivity::Offline).await?;

    let (status, _) = send(&app, "POST", "/queue/not-an-id/requeue", None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = ItemId::new();
    let (status, _) = send(&app, "POST", &format!("/queue/{unknown}/requeue"), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, "POST", "/queue", Some(json!({ "payload": "hi" }))).await?;
    let id = body["id"].as_str().unwrap_or_default().to_string();
    let (status, body) = send(&app, "POST", &format!("/queue/{id}/requeue"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requeued"], false);
    Ok(())
}

#[tokio::test]
async fn storage_errors_map_to_http_statuses() -> anyhow::Result<()> {
    let kv = Arc::new(MemoryKv::with_capacity(2));
    let delivery = Arc::new(RecordingDelivery::default());
    let (_queue, app) = setup(kv.clone(), delivery, Connectivity::Offline).await?;

    for _ in 0..2 {
        let (status, _) = send(&app, "POST", "/queue", Some(json!({ "payload": 1 }))).await?;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, _) = send(&app, "POST", "/queue", Some(json!({ "payload": 1 }))).await?;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);

    kv.set_available(false);
    let (status, _) = send(&app, "GET", "/queue", None).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
