//! Prometheus text exposition.

use axum::extract::State;
use std::fmt::Write;
use std::sync::Arc;

use crate::state::AppState;

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# HELP zephyr_jobs_total Jobs by status.\n# TYPE zephyr_jobs_total gauge"
    );
    if let Ok(counts) = state.store.count_jobs_by_status().await {
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.as_str());
        for (status, count) in counts {
            let _ = writeln!(out, "zephyr_jobs_total{{status=\"{status}\"}} {count}");
        }
    }

    let _ = writeln!(
        out,
        "# HELP zephyr_active_jobs Jobs currently dispatched to executors.\n# TYPE zephyr_active_jobs gauge"
    );
    let _ = writeln!(out, "zephyr_active_jobs {}", state.scheduler.active_jobs());

    let _ = writeln!(
        out,
        "# HELP zephyr_max_concurrent Configured concurrency cap.\n# TYPE zephyr_max_concurrent gauge"
    );
    let _ = writeln!(
        out,
        "zephyr_max_concurrent {}",
        state.scheduler.max_concurrent()
    );

    let _ = writeln!(
        out,
        "# HELP zephyr_log_channels Live log fan-out channels.\n# TYPE zephyr_log_channels gauge"
    );
    let _ = writeln!(out, "zephyr_log_channels {}", state.bus.active_channels());

    out
}
