//! HTTP control surface for Zephyr CI.
//!
//! A thin axum layer over the store and the scheduler handle: project and
//! run queries, manual triggering, the GitHub webhook receiver, Prometheus
//! text metrics and a WebSocket feed of live job output.

pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod webhook;
pub mod ws;

pub use routes::create_router;
pub use state::AppState;
