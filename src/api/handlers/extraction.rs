use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::models::ExtractionRequest;
use crate::services::dispatch::{DispatchHandle, ExtractionOutcome};
use crate::services::extractor::ExtractorRegistry;
use crate::storage::SqliteLineageSink;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: DispatchHandle,
    pub registry: Arc<ExtractorRegistry>,
    pub sink: SqliteLineageSink,
    pub default_properties: Arc<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct TaskTypeInfo {
    pub code: i32,
    pub extractor: &'static str,
}

/// Acknowledgement returned for every accepted request
#[derive(Debug, Serialize)]
pub struct ExtractionAck {
    pub ack: &'static str,
    pub outcome: ExtractionOutcome,
}

/// List task types with a registered extractor
pub async fn list_task_types(State(state): State<AppState>) -> Json<serde_json::Value> {
    let task_types: Vec<TaskTypeInfo> = state
        .registry
        .task_types()
        .into_iter()
        .map(|(code, extractor)| TaskTypeInfo { code, extractor })
        .collect();

    Json(serde_json::json!({
        "taskTypes": task_types
    }))
}

/// Extract lineage for one task execution and wait for its acknowledgement
pub async fn submit_extraction(
    State(state): State<AppState>,
    Json(payload): Json<ExtractionRequest>,
) -> Result<Json<ExtractionAck>, AppError> {
    if payload.record.task_id.trim().is_empty() {
        return Err(AppError::Validation("Task id cannot be empty".to_string()));
    }

    let request = payload.with_defaults(&state.default_properties);
    tracing::info!("Extraction requested: {}", request);

    let outcome = state
        .dispatcher
        .submit(request)
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    Ok(Json(ExtractionAck {
        ack: outcome.ack(),
        outcome,
    }))
}

/// Stored lineage records of one flow execution
pub async fn get_flow_lineage(
    State(state): State<AppState>,
    Path((app_id, flow_exec_id)): Path<(i32, i64)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let records = state.sink.list_flow_records(app_id, flow_exec_id).await?;

    if records.is_empty() {
        return Err(AppError::NotFound(format!(
            "No lineage for app {} flow execution {}",
            app_id, flow_exec_id
        )));
    }

    Ok(Json(serde_json::json!({
        "records": records
    })))
}
