//! Restart recovery.
//!
//! No attempt is made to reattach to hypervisor processes from a previous
//! run of the server; anything non-terminal in the store is reconciled here
//! before the scheduler starts.

use crate::{db_err, Store};
use chrono::Utc;
use sqlx::Row;
use tracing::{info, warn};
use zephyr_core::run::Status;
use zephyr_core::Result;

pub const ORPHAN_EXIT_CODE: i32 = -1;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub failed_jobs: u64,
    pub failed_runs: u64,
    pub requeued_runs: u64,
}

impl Store {
    /// Reconcile runs and jobs left non-terminal by a previous process.
    ///
    /// Jobs that had started are marked `failure` with exit code -1
    /// ("orphaned on restart"). A run whose jobs were all still pending is
    /// put back in the queue; any other non-terminal run becomes `failure`.
    pub async fn recover_orphans(&self) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        let now = Utc::now();

        let result = sqlx::query(
            r#"UPDATE jobs SET status = 'failure', exit_code = ?, finished_at = ?
               WHERE status IN ('queued', 'running')"#,
        )
        .bind(ORPHAN_EXIT_CODE)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        summary.failed_jobs = result.rows_affected();

        // Steps under those jobs that never finished are failures too.
        sqlx::query(
            r#"UPDATE steps SET status = 'failure'
               WHERE status = 'running'
                 AND job_id IN (SELECT id FROM jobs WHERE exit_code = ?)"#,
        )
        .bind(ORPHAN_EXIT_CODE)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        let rows = sqlx::query(
            r#"SELECT r.id AS run_id,
                      SUM(CASE WHEN j.status != 'pending' THEN 1 ELSE 0 END) AS non_pending
               FROM pipeline_runs r LEFT JOIN jobs j ON j.pipeline_run_id = r.id
               WHERE r.status IN ('queued', 'running')
               GROUP BY r.id"#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        for row in rows {
            let run_id: String = row.get("run_id");
            let non_pending: i64 = row.get::<Option<i64>, _>("non_pending").unwrap_or(0);

            if non_pending == 0 {
                // Nothing ran; drop the stale rows so re-initialization can
                // recreate them.
                sqlx::query(
                    "DELETE FROM steps WHERE job_id IN (SELECT id FROM jobs WHERE pipeline_run_id = ?)",
                )
                .bind(&run_id)
                .execute(self.pool())
                .await
                .map_err(db_err)?;
                sqlx::query("DELETE FROM jobs WHERE pipeline_run_id = ?")
                    .bind(&run_id)
                    .execute(self.pool())
                    .await
                    .map_err(db_err)?;
                sqlx::query("UPDATE pipeline_runs SET status = 'pending', started_at = NULL WHERE id = ?")
                    .bind(&run_id)
                    .execute(self.pool())
                    .await
                    .map_err(db_err)?;
                summary.requeued_runs += 1;
            } else {
                sqlx::query("UPDATE pipeline_runs SET status = 'failure', finished_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(&run_id)
                    .execute(self.pool())
                    .await
                    .map_err(db_err)?;
                summary.failed_runs += 1;
                warn!(run_id = %run_id, "run orphaned on restart, marked failure");
            }
        }

        if summary.failed_jobs > 0 || summary.requeued_runs > 0 {
            info!(
                failed_jobs = summary.failed_jobs,
                failed_runs = summary.failed_runs,
                requeued_runs = summary.requeued_runs,
                "restart recovery complete"
            );
        }

        Ok(summary)
    }

    /// Convenience for recovery paths that need the pending count.
    pub async fn count_runs_with_status(&self, status: Status) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pipeline_runs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.pool())
            .await
            .map_err(db_err)?;
        Ok(row.get("n"))
    }
}
