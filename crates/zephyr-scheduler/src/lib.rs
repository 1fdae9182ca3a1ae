//! Pipeline scheduling for Zephyr CI.
//!
//! The scheduler is the single owner of per-run DAG state. It ingests
//! pending runs from the store, expands matrices, dispatches ready jobs to
//! executors under the global concurrency cap, and applies completions
//! until each run reaches a terminal status. Executors run one job each,
//! inside one microVM each.

pub mod dag;
pub mod executor;
pub mod logbus;
pub mod matrix;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagError, JobDag, NodeStatus};
pub use executor::{JobExecutor, JobOutcome, JobRequest, VmExecutorConfig, VmJobExecutor};
pub use logbus::LogBus;
pub use matrix::{expand_pipeline, ExpandedPipeline, MatrixGroup};
pub use scheduler::{
    PipelineSource, Scheduler, SchedulerCommand, SchedulerConfig, SchedulerHandle,
};
pub use triggers::{event_matches, TriggerEvent};
