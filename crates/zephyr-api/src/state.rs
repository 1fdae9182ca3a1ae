//! Application state shared across handlers.

use std::sync::Arc;

use zephyr_scheduler::{LogBus, PipelineSource, SchedulerHandle};
use zephyr_store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub scheduler: SchedulerHandle,
    pub bus: Arc<LogBus>,
    pub source: Arc<dyn PipelineSource>,
    /// Enables the auth middleware when set.
    pub api_key: Option<String>,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(
        store: Store,
        scheduler: SchedulerHandle,
        bus: Arc<LogBus>,
        source: Arc<dyn PipelineSource>,
        api_key: Option<String>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            store,
            scheduler,
            bus,
            source,
            api_key,
            webhook_secret,
        }
    }
}
