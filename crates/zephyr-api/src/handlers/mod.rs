pub mod health;
pub mod jobs;
pub mod projects;
pub mod runs;

use axum::http::StatusCode;

pub(crate) fn internal(e: zephyr_core::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub(crate) fn bad_id(what: &str) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, format!("invalid {what} ID"))
}
