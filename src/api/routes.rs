use axum::{
    routing::{get, post},
    Router,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::handlers::{extraction, AppState};
use crate::services::dispatch::DispatchHandle;
use crate::services::extractor::ExtractorRegistry;
use crate::storage::SqliteLineageSink;

/// Create router with application state
pub fn create_router_with_state(
    dispatcher: DispatchHandle,
    registry: Arc<ExtractorRegistry>,
    sink: SqliteLineageSink,
    default_properties: BTreeMap<String, String>,
) -> Router {
    let state = AppState {
        dispatcher,
        registry,
        sink,
        default_properties: Arc::new(default_properties),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/lineage/task-types", get(extraction::list_task_types))
        .route("/api/lineage/extractions", post(extraction::submit_extraction))
        .route(
            "/api/lineage/flows/{app_id}/{flow_exec_id}",
            get(extraction::get_flow_lineage),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
