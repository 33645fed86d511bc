use crate::connectivity::ConnectivityMonitor;
use crate::error::QueueError;
use crate::models::{Connectivity, EngineState, ItemId, QueueItem, QueueStatus};
use crate::queue::{Config as QueueConfig, OfflineQueue};
use crate::sync::Delivery;
use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

/// Run the HTTP server on the given port
pub async fn run_server(
    port: u16,
    cfg: QueueConfig,
    delivery: Arc<dyn Delivery>,
) -> anyhow::Result<()> {
    // The host reports connectivity through PUT /connectivity.
    let monitor = ConnectivityMonitor::new(Connectivity::Online);
    let queue = Arc::new(OfflineQueue::open_sqlite(&cfg, delivery, monitor).await?);
    tokio::spawn(log_sync_events(queue.clone()));

    let app = app_router(queue);

    // Allow overriding bind address via env (useful for Docker). Default 127.0.0.1
    let bind_ip =
        std::env::var("POSTBOX_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());
    let ip: IpAddr = bind_ip
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    let addr = SocketAddr::from((ip, port));
    tracing::info!("Listening on {} - Use Ctrl+C to quit.", addr);
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind address: {e}");
        anyhow!("Bind error: {e}")
    })?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {e}");
            }
            tracing::info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await
        .map_err(|e| {
            tracing::error!("Server error: {e}");
            anyhow!("Server error: {e}")
        })?;
    Ok(())
}

/// Construct the Axum `Router` for the service, injecting shared state.
pub fn app_router(queue: Arc<OfflineQueue>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/queue",
            get(list_pending).post(enqueue_http).delete(clear_queue),
        )
        .route("/queue/{id}/requeue", post(requeue_item))
        .route("/sync", post(trigger_sync))
        .route("/status", get(queue_status))
        .route("/connectivity", put(set_connectivity))
        .with_state(queue)
}

/// Relay sync progress to the log, like the toasts a UI would show.
async fn log_sync_events(queue: Arc<OfflineQueue>) {
    let mut events = queue.events();
    loop {
        match events.recv().await {
            Ok(event) => tracing::info!(?event, "sync event"),
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "sync event log lagging")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

type ApiError = (StatusCode, String);

fn api_error(err: QueueError) -> ApiError {
    let status = match &err {
        QueueError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
        QueueError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::DuplicateItem(_) => StatusCode::CONFLICT,
        QueueError::UnknownItem(_) => StatusCode::NOT_FOUND,
        QueueError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

// Request payload for enqueueing an item
#[derive(Deserialize)]
struct EnqueueBody {
    payload: serde_json::Value,
}

#[derive(Serialize)]
struct Enqueued {
    id: ItemId,
}

#[derive(Deserialize)]
struct ConnectivityBody {
    online: bool,
}

#[derive(Serialize)]
struct SyncRequested {
    started: bool,
    state: EngineState,
}

// List queued items in enqueue order
async fn list_pending(
    State(queue): State<Arc<OfflineQueue>>,
) -> Result<Json<Vec<QueueItem>>, ApiError> {
    let items = queue.pending().await.map_err(api_error)?;
    Ok(Json(items))
}

// Queue a new item
async fn enqueue_http(
    State(queue): State<Arc<OfflineQueue>>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<Enqueued>), ApiError> {
    let id = queue.enqueue(&body.payload).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(Enqueued { id })))
}

// Discard everything
async fn clear_queue(
    State(queue): State<Arc<OfflineQueue>>,
) -> Result<StatusCode, ApiError> {
    queue.clear().await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// Put a failed item back in line
async fn requeue_item(
    Path(id): Path<String>,
    State(queue): State<Arc<OfflineQueue>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id: ItemId = id
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid id: {e}")))?;
    let requeued = queue.requeue(id).await.map_err(api_error)?;
    Ok(Json(json!({ "requeued": requeued })))
}

// Manual "retry now"
async fn trigger_sync(
    State(queue): State<Arc<OfflineQueue>>,
) -> (StatusCode, Json<SyncRequested>) {
    let started = queue.trigger_sync();
    let state = queue.engine_state();
    (StatusCode::ACCEPTED, Json(SyncRequested { started, state }))
}

async fn queue_status(
    State(queue): State<Arc<OfflineQueue>>,
) -> Result<Json<QueueStatus>, ApiError> {
    let status = queue.status().await.map_err(api_error)?;
    Ok(Json(status))
}

// Host connectivity feed
async fn set_connectivity(
    State(queue): State<Arc<OfflineQueue>>,
    Json(body): Json<ConnectivityBody>,
) -> Json<serde_json::Value> {
    let changed = queue.connectivity().set_status(body.online.into());
    Json(json!({ "online": body.online, "changed": changed }))
}
