//! Append-only log chunk storage.

use crate::projects::parse_id;
use crate::{db_err, Store};
use chrono::{DateTime, Utc};
use sqlx::Row;
use zephyr_core::ids::{JobId, StepId};
use zephyr_core::run::{LogChunk, LogStream};
use zephyr_core::Result;

impl Store {
    /// Append one output chunk and return its assigned sequence number.
    pub async fn append_log(
        &self,
        job_id: JobId,
        step_id: Option<StepId>,
        stream: LogStream,
        content: &[u8],
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO logs (job_id, step_id, stream, content, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id.as_uuid().to_string())
        .bind(step_id.map(|s| s.as_uuid().to_string()))
        .bind(stream.as_str())
        .bind(content)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(result.last_insert_rowid())
    }

    /// Ordered log tail for a job, optionally since a sequence cursor.
    pub async fn logs_for_job(&self, job_id: JobId, since_seq: Option<i64>) -> Result<Vec<LogChunk>> {
        let rows = sqlx::query(
            r#"SELECT seq, job_id, step_id, stream, content, timestamp
               FROM logs WHERE job_id = ? AND seq > ? ORDER BY seq ASC"#,
        )
        .bind(job_id.as_uuid().to_string())
        .bind(since_seq.unwrap_or(0))
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_chunk).collect()
    }
}

fn row_to_chunk(r: &sqlx::sqlite::SqliteRow) -> Result<LogChunk> {
    let stream: String = r.get("stream");
    let step_id: Option<String> = r.get("step_id");
    let content: Vec<u8> = r.get("content");

    Ok(LogChunk {
        seq: r.get("seq"),
        job_id: parse_id(r.get("job_id"))?,
        step_id: step_id.map(parse_id).transpose()?,
        stream: stream.parse().map_err(zephyr_core::Error::Database)?,
        content: String::from_utf8_lossy(&content).into_owned(),
        timestamp: r.get::<DateTime<Utc>, _>("timestamp"),
    })
}
