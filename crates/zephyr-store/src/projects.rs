//! Project operations.

use crate::{db_err, Store};
use chrono::{DateTime, Utc};
use sqlx::Row;
use zephyr_core::ids::ProjectId;
use zephyr_core::run::Project;
use zephyr_core::Result;

impl Store {
    pub async fn create_project(&self, name: &str, config_path: &str) -> Result<Project> {
        let project = Project {
            id: ProjectId::new(),
            name: name.to_string(),
            config_path: config_path.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO projects (id, name, config_path, created_at) VALUES (?, ?, ?, ?)")
            .bind(project.id.as_uuid().to_string())
            .bind(&project.name)
            .bind(&project.config_path)
            .bind(project.created_at)
            .execute(self.pool())
            .await
            .map_err(db_err)?;

        Ok(project)
    }

    pub async fn get_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, config_path, created_at FROM projects WHERE id = ?")
            .bind(id.as_uuid().to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)?;

        row.map(|r| row_to_project(&r)).transpose()
    }

    pub async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let row =
            sqlx::query("SELECT id, name, config_path, created_at FROM projects WHERE name = ?")
                .bind(name)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err)?;

        row.map(|r| row_to_project(&r)).transpose()
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows =
            sqlx::query("SELECT id, name, config_path, created_at FROM projects ORDER BY name")
                .fetch_all(self.pool())
                .await
                .map_err(db_err)?;

        rows.iter().map(row_to_project).collect()
    }
}

fn row_to_project(r: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    Ok(Project {
        id: parse_id(r.get("id"))?,
        name: r.get("name"),
        config_path: r.get("config_path"),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
    })
}

pub(crate) fn parse_id<T: std::str::FromStr>(s: String) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e: T::Err| zephyr_core::Error::Database(format!("bad id {s}: {e}")))
}
