//! Artifact records and opaque secret storage.
//!
//! Artifact bytes live on disk at `path`; secret values are stored as
//! given. Encryption-at-rest belongs to an outer layer.

use crate::projects::parse_id;
use crate::{db_err, Store};
use chrono::{DateTime, Utc};
use sqlx::Row;
use zephyr_core::ids::{ArtifactId, JobId};
use zephyr_core::Result;

#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Store {
    pub async fn create_artifact(
        &self,
        job_id: JobId,
        name: &str,
        path: &str,
        size_bytes: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Artifact> {
        let artifact = Artifact {
            id: ArtifactId::new(),
            job_id,
            name: name.to_string(),
            path: path.to_string(),
            size_bytes,
            created_at: Utc::now(),
            expires_at,
        };

        sqlx::query(
            r#"INSERT INTO artifacts (id, job_id, name, path, size_bytes, created_at, expires_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(artifact.id.as_uuid().to_string())
        .bind(artifact.job_id.as_uuid().to_string())
        .bind(&artifact.name)
        .bind(&artifact.path)
        .bind(artifact.size_bytes)
        .bind(artifact.created_at)
        .bind(artifact.expires_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        Ok(artifact)
    }

    pub async fn artifacts_for_job(&self, job_id: JobId) -> Result<Vec<Artifact>> {
        let rows = sqlx::query(
            r#"SELECT id, job_id, name, path, size_bytes, created_at, expires_at
               FROM artifacts WHERE job_id = ? ORDER BY created_at"#,
        )
        .bind(job_id.as_uuid().to_string())
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(Artifact {
                    id: parse_id(r.get("id"))?,
                    job_id: parse_id(r.get("job_id"))?,
                    name: r.get("name"),
                    path: r.get("path"),
                    size_bytes: r.get("size_bytes"),
                    created_at: r.get::<DateTime<Utc>, _>("created_at"),
                    expires_at: r.get::<Option<DateTime<Utc>>, _>("expires_at"),
                })
            })
            .collect()
    }

    pub async fn put_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO secrets (name, value, created_at, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(name)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM secrets WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }
}
