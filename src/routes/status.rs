use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::config::AppConfig;
use crate::error::Result;
use crate::queue::StatusReport;
use crate::server::AppState;

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatusReport>> {
    let handle = state.facade.get_status()?;
    let report = handle.wait().await?;
    Ok(Json(report))
}

/// Re-read the configuration files and rebuild the engine behind the
/// worker. In-flight queries drain before the swap.
pub async fn reload_config(State(state): State<AppState>) -> Result<Json<Value>> {
    let config = AppConfig::load(state.facade.repo_path())?;
    let handle = state.facade.reload_config(config)?;
    handle.wait().await?;
    Ok(Json(json!({ "status": "reloaded" })))
}

/// Kick an analysis pass without waiting for the idle interval.
pub async fn trigger_analyze(State(state): State<AppState>) -> Json<Value> {
    state.facade.request_maintenance();
    Json(json!({ "status": "analysis_requested" }))
}
