//! Run, job and step execution state.

use crate::ids::{DeliveryId, JobId, ProjectId, RunId, StepId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub config_path: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRun {
    pub id: RunId,
    pub project_id: ProjectId,
    pub pipeline_name: String,
    pub status: Status,
    pub trigger_type: String,
    /// Opaque blob of the originating event (webhook payload, API body).
    pub trigger_data: Option<serde_json::Value>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    /// Unique within the run; matrix-expanded names carry the axis values.
    pub name: String,
    pub status: Status,
    pub runner_image: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    pub name: String,
    /// 0-based, total within the job.
    pub order: u32,
    pub status: Status,
    pub exit_code: Option<i32>,
}

/// Status shared by runs, jobs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Status::Pending),
            "queued" => Ok(Status::Queued),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failure" => Ok(Status::Failure),
            "cancelled" => Ok(Status::Cancelled),
            "skipped" => Ok(Status::Skipped),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(format!("unknown stream: {other}")),
        }
    }
}

/// One durable chunk of job output. Sequence numbers are assigned by the
/// store and strictly increase in emission order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogChunk {
    pub seq: i64,
    pub job_id: JobId,
    pub step_id: Option<StepId>,
    pub stream: LogStream,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub provider: String,
    pub event_type: String,
    pub payload: String,
    pub signature: Option<String>,
    pub processed: bool,
    pub run_id: Option<RunId>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Skipped.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Queued.is_terminal());
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            Status::Pending,
            Status::Queued,
            Status::Running,
            Status::Success,
            Status::Failure,
            Status::Cancelled,
            Status::Skipped,
        ] {
            let parsed: Status = s.as_str().parse().unwrap();
            assert_eq!(s, parsed);
        }
    }
}
