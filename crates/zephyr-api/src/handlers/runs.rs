//! Run handlers: listing, manual triggering, cancellation.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zephyr_core::ids::RunId;
use zephyr_core::run::{Job, PipelineRun};
use zephyr_store::RunTrigger;

use super::{bad_id, internal};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListRunsParams {
    pub id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

#[derive(Serialize)]
pub struct RunResponse {
    pub id: String,
    pub project_id: String,
    pub pipeline_name: String,
    pub status: String,
    pub trigger_type: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobResponse>>,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub status: String,
    pub runner_image: String,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl From<&PipelineRun> for RunResponse {
    fn from(run: &PipelineRun) -> Self {
        Self {
            id: run.id.to_string(),
            project_id: run.project_id.to_string(),
            pipeline_name: run.pipeline_name.clone(),
            status: run.status.to_string(),
            trigger_type: run.trigger_type.clone(),
            branch: run.branch.clone(),
            commit_sha: run.commit_sha.clone(),
            created_at: run.created_at.to_rfc3339(),
            started_at: run.started_at.map(|t| t.to_rfc3339()),
            finished_at: run.finished_at.map(|t| t.to_rfc3339()),
            jobs: None,
        }
    }
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            name: job.name.clone(),
            status: job.status.to_string(),
            runner_image: job.runner_image.clone(),
            exit_code: job.exit_code,
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Vec<RunResponse>>, (StatusCode, String)> {
    if let Some(id) = &params.id {
        let run_id: RunId = id.parse().map_err(|_| bad_id("run"))?;
        let run = state
            .store
            .get_run(run_id)
            .await
            .map_err(internal)?
            .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))?;

        let jobs = state.store.jobs_for_run(run_id).await.map_err(internal)?;
        let mut response = RunResponse::from(&run);
        response.jobs = Some(jobs.iter().map(JobResponse::from).collect());
        return Ok(Json(vec![response]));
    }

    let runs = state
        .store
        .list_runs(params.limit)
        .await
        .map_err(internal)?;
    Ok(Json(runs.iter().map(RunResponse::from).collect()))
}

#[derive(Deserialize)]
pub struct TriggerRequest {
    pub project: String,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

#[derive(Serialize)]
pub struct TriggerResponse {
    pub id: String,
}

pub async fn trigger_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), (StatusCode, String)> {
    let project = state
        .store
        .get_project_by_name(&request.project)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "project not found".to_string()))?;

    let run = state
        .store
        .create_run(
            project.id,
            request.pipeline.as_deref().unwrap_or("default"),
            RunTrigger {
                trigger_type: "api".to_string(),
                trigger_data: None,
                branch: request.branch,
                commit_sha: request.commit_sha,
            },
        )
        .await
        .map_err(internal)?;

    state.scheduler.notify_run_queued(run.id).await;

    Ok((
        StatusCode::CREATED,
        Json(TriggerResponse {
            id: run.id.to_string(),
        }),
    ))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let run_id: RunId = id.parse().map_err(|_| bad_id("run"))?;
    state
        .store
        .get_run(run_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, "run not found".to_string()))?;

    state.scheduler.cancel_run(run_id).await;
    Ok(StatusCode::ACCEPTED)
}
