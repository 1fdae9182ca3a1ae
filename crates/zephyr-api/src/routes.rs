//! API route definitions.

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers::{health, jobs, projects, runs};
use crate::middleware::{cors_layer, require_api_key};
use crate::state::AppState;
use crate::{metrics, webhook, ws};

/// Create the main router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route("/runs", get(runs::list_runs))
        .route("/trigger", post(runs::trigger_run))
        .route("/runs/{id}/cancel", post(runs::cancel_run))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/logs", get(jobs::get_job_logs))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .route("/webhooks/github", post(webhook::github_webhook))
        .route("/ws", get(ws::ws_handler))
        .layer(cors_layer())
        .with_state(state)
}
