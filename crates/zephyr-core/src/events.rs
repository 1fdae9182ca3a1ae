//! In-process event payloads.
//!
//! These are the messages fanned out to API subscribers (WebSocket, log
//! polling). Durable history lives in the store; events are best-effort.

use crate::ids::{JobId, RunId, StepId};
use crate::run::{LogStream, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A chunk of stdout/stderr was observed for the job.
    Output(OutputChunk),
    /// The job's status changed.
    StatusChanged(JobStatusChange),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChunk {
    pub job_id: JobId,
    pub step_id: Option<StepId>,
    pub stream: LogStream,
    pub content: String,
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusChange {
    pub run_id: RunId,
    pub job_id: JobId,
    pub status: Status,
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}
