use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{Json, extract::State};
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::server::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();
static SHUTDOWN: OnceLock<Arc<Notify>> = OnceLock::new();

/// Record the process start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

fn shutdown_notify() -> &'static Arc<Notify> {
    SHUTDOWN.get_or_init(|| Arc::new(Notify::new()))
}

/// Resolves once a shutdown has been requested over HTTP.
pub async fn wait_for_shutdown() {
    shutdown_notify().notified().await;
}

/// Liveness plus a snapshot of the index: the probe answer doubles as a
/// quick "is the engine keeping up" readout. A closed or wedged worker
/// degrades the status instead of failing the probe.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = START_TIME.get().map(|s| s.elapsed().as_secs()).unwrap_or(0);

    let report = match state.facade.get_status() {
        Ok(handle) => handle.wait().await.ok(),
        Err(_) => None,
    };

    let Some(report) = report else {
        return Json(json!({
            "status": "degraded",
            "service": "seagoat-server",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": uptime,
        }));
    };

    Json(json!({
        "status": "ok",
        "service": "seagoat-server",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
        "chunks_analyzed": report.chunks_analyzed,
        "total_files": report.total_files,
        "queue_depth": report.queue_depth,
        "stale": report.stale,
        "last_analyzed_at_unix": report.last_analyzed_at_unix,
    }))
}

/// Ask the server to drain and exit; the engine persists on the way down.
pub async fn shutdown_handler() -> Json<Value> {
    tracing::info!("Shutdown requested via HTTP endpoint");
    shutdown_notify().notify_one();
    Json(json!({
        "status": "shutting_down",
    }))
}
