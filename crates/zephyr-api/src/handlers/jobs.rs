//! Job handlers: detail and durable log tail.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zephyr_core::ids::JobId;

use super::{bad_id, internal};
use crate::handlers::runs::JobResponse;
use crate::state::AppState;

#[derive(Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobResponse,
    pub steps: Vec<StepResponse>,
}

#[derive(Serialize)]
pub struct StepResponse {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub status: String,
    pub exit_code: Option<i32>,
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobDetailResponse>, (StatusCode, String)> {
    let job_id: JobId = id.parse().map_err(|_| bad_id("job"))?;
    let job = state
        .store
        .get_job(job_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "job not found".to_string()))?;

    let steps = state.store.steps_for_job(job_id).await.map_err(internal)?;

    Ok(Json(JobDetailResponse {
        job: JobResponse::from(&job),
        steps: steps
            .iter()
            .map(|s| StepResponse {
                id: s.id.to_string(),
                name: s.name.clone(),
                order: s.order,
                status: s.status.to_string(),
                exit_code: s.exit_code,
            })
            .collect(),
    }))
}

#[derive(Deserialize)]
pub struct LogsParams {
    /// Sequence cursor; only chunks after it are returned.
    pub since: Option<i64>,
}

#[derive(Serialize)]
pub struct LogsResponse {
    pub chunks: Vec<LogChunkResponse>,
    /// Pass back as `since` to resume the tail.
    pub last_seq: i64,
}

#[derive(Serialize)]
pub struct LogChunkResponse {
    pub seq: i64,
    pub step_id: Option<String>,
    pub stream: String,
    pub content: String,
    pub timestamp: String,
}

pub async fn get_job_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogsResponse>, (StatusCode, String)> {
    let job_id: JobId = id.parse().map_err(|_| bad_id("job"))?;
    let chunks = state
        .store
        .logs_for_job(job_id, params.since)
        .await
        .map_err(internal)?;

    let last_seq = chunks
        .last()
        .map(|c| c.seq)
        .or(params.since)
        .unwrap_or(0);

    Ok(Json(LogsResponse {
        chunks: chunks
            .iter()
            .map(|c| LogChunkResponse {
                seq: c.seq,
                step_id: c.step_id.map(|s| s.to_string()),
                stream: c.stream.as_str().to_string(),
                content: c.content.clone(),
                timestamp: c.timestamp.to_rfc3339(),
            })
            .collect(),
        last_seq,
    }))
}
