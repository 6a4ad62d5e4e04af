use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::facade::SearchFacade;
use crate::routes;

#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<SearchFacade>,
}

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/shutdown", post(routes::health::shutdown_handler))
        .route("/api/query", post(routes::query::run_query))
        .route("/api/stats", get(routes::status::get_stats))
        .route("/api/analyze", post(routes::status::trigger_analyze))
        .route("/api/reload", post(routes::status::reload_config))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
