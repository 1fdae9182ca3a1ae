//! Health endpoint.

use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use zephyr_core::run::Status;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub running: bool,
    #[serde(rename = "activeJobs")]
    pub active_jobs: usize,
    #[serde(rename = "maxConcurrent")]
    pub max_concurrent: usize,
    #[serde(rename = "queueStats")]
    pub queue_stats: HashMap<String, i64>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let queue_stats = state
        .store
        .count_jobs_by_status()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(status, count): (Status, i64)| (status.as_str().to_string(), count))
        .collect();

    Json(HealthResponse {
        status: "ok",
        running: true,
        active_jobs: state.scheduler.active_jobs(),
        max_concurrent: state.scheduler.max_concurrent(),
        queue_stats,
    })
}
