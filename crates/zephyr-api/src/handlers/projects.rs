//! Project handlers.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zephyr_core::run::Project;

use super::internal;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ProjectResponse {
    pub id: String,
    pub name: String,
    pub config_path: String,
    pub created_at: String,
}

impl From<&Project> for ProjectResponse {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id.to_string(),
            name: project.name.clone(),
            config_path: project.config_path.clone(),
            created_at: project.created_at.to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default = "default_config_path")]
    pub config_path: String,
}

fn default_config_path() -> String {
    "zephyr.yaml".to_string()
}

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ProjectResponse>>, (StatusCode, String)> {
    let projects = state.store.list_projects().await.map_err(internal)?;
    Ok(Json(projects.iter().map(ProjectResponse::from).collect()))
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectResponse>), (StatusCode, String)> {
    if request.name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "project name required".to_string()));
    }

    let project = state
        .store
        .create_project(&request.name, &request.config_path)
        .await
        .map_err(internal)?;

    Ok((StatusCode::CREATED, Json(ProjectResponse::from(&project))))
}
