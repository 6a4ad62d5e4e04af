use axum::{Json, extract::State};
use serde::Deserialize;

use crate::config::MAX_QUERY_LENGTH;
use crate::error::{Error, Result};
use crate::facade::QueryFilters;
use crate::merge::QueryResults;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, alias = "limit_lines")]
    pub limit_lines: Option<usize>,
    #[serde(default, alias = "context_above")]
    pub context_above: Option<u32>,
    #[serde(default, alias = "context_below")]
    pub context_below: Option<u32>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default, alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
}

pub async fn run_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResults>> {
    if request.query.trim().is_empty() {
        return Err(Error::EmptyQuery);
    }
    if request.query.len() > MAX_QUERY_LENGTH {
        return Err(Error::Config(format!(
            "Query too long ({} chars). Maximum allowed is {}.",
            request.query.len(),
            MAX_QUERY_LENGTH,
        )));
    }
    if request.limit_lines == Some(0) {
        return Err(Error::Config("limitLines must be positive".to_string()));
    }

    let filters = QueryFilters {
        include: request.include,
        exclude: request.exclude,
        limit_lines: request.limit_lines,
        context_above: request.context_above,
        context_below: request.context_below,
        timeout_ms: request.timeout_ms,
    };

    let handle = state.facade.submit_query(&request.query, &filters)?;
    let results = handle.wait().await?;
    Ok(Json(results))
}
