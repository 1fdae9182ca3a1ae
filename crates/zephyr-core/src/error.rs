//! Error types for Zephyr CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Dependency cycle involving job: {0}")]
    DependencyCycle(String),

    #[error("Unknown job dependency: {0}")]
    UnknownDependency(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already completed")]
    RunAlreadyCompleted,

    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timeout after {seconds} seconds")]
    StepTimeout { seconds: u64 },

    // VM errors
    #[error("Hypervisor failed to start: {0}")]
    HypervisorStartFailed(String),

    #[error("Hypervisor API error ({status}): {fault_message}")]
    HypervisorApi { status: u16, fault_message: String },

    #[error("Network setup failed: {0}")]
    NetworkSetupFailed(String),

    #[error("Agent unreachable in VM {0}")]
    AgentUnreachable(String),

    #[error("Agent protocol error: {0}")]
    AgentProtocol(String),

    // Webhook errors
    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
