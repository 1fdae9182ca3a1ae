//! Job and step operations, including the job-queue reads.

use crate::projects::parse_id;
use crate::{db_err, Store};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use zephyr_core::ids::{JobId, RunId, StepId};
use zephyr_core::run::{Job, Status, Step};
use zephyr_core::Result;

impl Store {
    pub async fn create_job(&self, run_id: RunId, name: &str, runner_image: &str) -> Result<Job> {
        let job = Job {
            id: JobId::new(),
            run_id,
            name: name.to_string(),
            status: Status::Pending,
            runner_image: runner_image.to_string(),
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        sqlx::query(
            r#"INSERT INTO jobs (id, pipeline_run_id, name, status, runner_image, exit_code, created_at)
               VALUES (?, ?, ?, ?, ?, NULL, ?)"#,
        )
        .bind(job.id.as_uuid().to_string())
        .bind(job.run_id.as_uuid().to_string())
        .bind(&job.name)
        .bind(job.status.as_str())
        .bind(&job.runner_image)
        .bind(job.created_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("{JOB_COLUMNS} WHERE id = ?"))
            .bind(id.as_uuid().to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    pub async fn jobs_for_run(&self, run_id: RunId) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "{JOB_COLUMNS} WHERE pipeline_run_id = ? ORDER BY created_at, name"
        ))
        .bind(run_id.as_uuid().to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_job).collect()
    }

    pub async fn update_job_status(
        &self,
        id: JobId,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs
               SET status = ?,
                   started_at = COALESCE(?, started_at),
                   finished_at = COALESCE(?, finished_at),
                   exit_code = COALESCE(?, exit_code)
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(exit_code)
        .bind(id.as_uuid().to_string())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Oldest pending job, FIFO by `created_at`.
    pub async fn next_pending_job(&self) -> Result<Option<Job>> {
        Ok(self.pending_jobs(1).await?.into_iter().next())
    }

    pub async fn pending_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "{JOB_COLUMNS} WHERE status = 'pending' ORDER BY created_at ASC LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_job).collect()
    }

    /// Job counts keyed by status, for metrics and admission control.
    pub async fn count_jobs_by_status(&self) -> Result<HashMap<Status, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;

        let mut counts = HashMap::new();
        for r in rows {
            let status: String = r.get("status");
            let status: Status = status.parse().map_err(zephyr_core::Error::Database)?;
            counts.insert(status, r.get::<i64, _>("n"));
        }
        Ok(counts)
    }

    pub async fn create_step(&self, job_id: JobId, name: &str, order: u32) -> Result<Step> {
        let step = Step {
            id: StepId::new(),
            job_id,
            name: name.to_string(),
            order,
            status: Status::Pending,
            exit_code: None,
        };

        sqlx::query(
            "INSERT INTO steps (id, job_id, name, step_order, status, exit_code) VALUES (?, ?, ?, ?, ?, NULL)",
        )
        .bind(step.id.as_uuid().to_string())
        .bind(step.job_id.as_uuid().to_string())
        .bind(&step.name)
        .bind(step.order as i64)
        .bind(step.status.as_str())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(step)
    }

    pub async fn steps_for_job(&self, job_id: JobId) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, job_id, name, step_order, status, exit_code FROM steps WHERE job_id = ? ORDER BY step_order",
        )
        .bind(job_id.as_uuid().to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_step).collect()
    }

    pub async fn update_step_status(
        &self,
        id: StepId,
        status: Status,
        exit_code: Option<i32>,
    ) -> Result<()> {
        sqlx::query("UPDATE steps SET status = ?, exit_code = COALESCE(?, exit_code) WHERE id = ?")
            .bind(status.as_str())
            .bind(exit_code)
            .bind(id.as_uuid().to_string())
            .execute(self.pool())
            .await
            .map_err(db_err)?;

        Ok(())
    }
}

const JOB_COLUMNS: &str = r#"SELECT id, pipeline_run_id, name, status, runner_image, exit_code,
           created_at, started_at, finished_at
    FROM jobs"#;

pub(crate) fn row_to_job(r: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let status: String = r.get("status");
    Ok(Job {
        id: parse_id(r.get("id"))?,
        run_id: parse_id(r.get("pipeline_run_id"))?,
        name: r.get("name"),
        status: status.parse().map_err(zephyr_core::Error::Database)?,
        runner_image: r.get("runner_image"),
        exit_code: r.get::<Option<i64>, _>("exit_code").map(|c| c as i32),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
        started_at: r.get::<Option<DateTime<Utc>>, _>("started_at"),
        finished_at: r.get::<Option<DateTime<Utc>>, _>("finished_at"),
    })
}

fn row_to_step(r: &sqlx::sqlite::SqliteRow) -> Result<Step> {
    let status: String = r.get("status");
    Ok(Step {
        id: parse_id(r.get("id"))?,
        job_id: parse_id(r.get("job_id"))?,
        name: r.get("name"),
        order: r.get::<i64, _>("step_order") as u32,
        status: status.parse().map_err(zephyr_core::Error::Database)?,
        exit_code: r.get::<Option<i64>, _>("exit_code").map(|c| c as i32),
    })
}
