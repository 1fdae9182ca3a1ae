//! Pipeline run operations.

use crate::projects::parse_id;
use crate::{db_err, Store};
use chrono::{DateTime, Utc};
use sqlx::Row;
use zephyr_core::ids::{ProjectId, RunId};
use zephyr_core::run::{PipelineRun, Status};
use zephyr_core::Result;

/// Trigger metadata captured when a run is created.
#[derive(Debug, Clone)]
pub struct RunTrigger {
    pub trigger_type: String,
    pub trigger_data: Option<serde_json::Value>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
}

impl Store {
    pub async fn create_run(
        &self,
        project_id: ProjectId,
        pipeline_name: &str,
        trigger: RunTrigger,
    ) -> Result<PipelineRun> {
        let run = PipelineRun {
            id: RunId::new(),
            project_id,
            pipeline_name: pipeline_name.to_string(),
            status: Status::Pending,
            trigger_type: trigger.trigger_type,
            trigger_data: trigger.trigger_data,
            branch: trigger.branch,
            commit_sha: trigger.commit_sha,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let trigger_json = run
            .trigger_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO pipeline_runs
               (id, project_id, pipeline_name, status, trigger_type, trigger_data,
                branch, commit_sha, created_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)"#,
        )
        .bind(run.id.as_uuid().to_string())
        .bind(run.project_id.as_uuid().to_string())
        .bind(&run.pipeline_name)
        .bind(run.status.as_str())
        .bind(&run.trigger_type)
        .bind(trigger_json)
        .bind(&run.branch)
        .bind(&run.commit_sha)
        .bind(run.created_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(run)
    }

    pub async fn get_run(&self, id: RunId) -> Result<Option<PipelineRun>> {
        let row = sqlx::query(RUN_COLUMNS_WHERE_ID)
            .bind(id.as_uuid().to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.map(|r| row_to_run(&r)).transpose()
    }

    pub async fn list_runs(&self, limit: u32) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(
            r#"SELECT id, project_id, pipeline_name, status, trigger_type, trigger_data,
                      branch, commit_sha, created_at, started_at, finished_at
               FROM pipeline_runs ORDER BY created_at DESC LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_run).collect()
    }

    /// Pending runs in FIFO order, for scheduler pickup.
    pub async fn pending_runs(&self, limit: u32) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query(
            r#"SELECT id, project_id, pipeline_name, status, trigger_type, trigger_data,
                      branch, commit_sha, created_at, started_at, finished_at
               FROM pipeline_runs WHERE status = 'pending'
               ORDER BY created_at ASC LIMIT ?"#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_run).collect()
    }

    /// Set the run status. Re-applying the current status is a no-op; a run
    /// already in a terminal status is never mutated again.
    pub async fn update_run_status(
        &self,
        id: RunId,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE pipeline_runs
               SET status = ?,
                   started_at = COALESCE(?, started_at),
                   finished_at = COALESCE(?, finished_at)
               WHERE id = ?
                 AND status NOT IN ('success', 'failure', 'cancelled', 'skipped')"#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(id.as_uuid().to_string())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

const RUN_COLUMNS_WHERE_ID: &str = r#"SELECT id, project_id, pipeline_name, status, trigger_type, trigger_data,
           branch, commit_sha, created_at, started_at, finished_at
    FROM pipeline_runs WHERE id = ?"#;

pub(crate) fn row_to_run(r: &sqlx::sqlite::SqliteRow) -> Result<PipelineRun> {
    let status: String = r.get("status");
    let trigger_data: Option<String> = r.get("trigger_data");

    Ok(PipelineRun {
        id: parse_id(r.get("id"))?,
        project_id: parse_id(r.get("project_id"))?,
        pipeline_name: r.get("pipeline_name"),
        status: status
            .parse()
            .map_err(zephyr_core::Error::Database)?,
        trigger_type: r.get("trigger_type"),
        trigger_data: trigger_data
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        branch: r.get("branch"),
        commit_sha: r.get("commit_sha"),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
        started_at: r.get::<Option<DateTime<Utc>>, _>("started_at"),
        finished_at: r.get::<Option<DateTime<Utc>>, _>("finished_at"),
    })
}
