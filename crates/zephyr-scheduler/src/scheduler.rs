//! Run coordination.
//!
//! One event-loop actor owns every active run's DAG. Commands (run queued,
//! cancel, shutdown) and executor completions arrive on channels; a store
//! poll picks up runs enqueued by other processes. Dispatch respects the
//! global concurrency cap and per-matrix `max_parallel`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use zephyr_core::events::{JobEvent, JobStatusChange};
use zephyr_core::ids::RunId;
use zephyr_core::pipeline::{JobDefinition, PipelineDefinition};
use zephyr_core::run::{Job, PipelineRun, Project, Status, Step};
use zephyr_core::{Error, Result};
use zephyr_store::Store;

use crate::dag::{DagError, JobDag, NodeStatus};
use crate::executor::{JobExecutor, JobOutcome, JobRequest};
use crate::logbus::LogBus;
use crate::matrix::{expand_pipeline, MatrixGroup};

/// Resolves a project's pipeline definition. Implemented by the
/// configuration loader; conditions arrive already reduced to booleans.
#[async_trait]
pub trait PipelineSource: Send + Sync {
    async fn resolve(&self, project: &Project, pipeline_name: &str) -> Result<PipelineDefinition>;
}

#[derive(Debug)]
pub enum SchedulerCommand {
    RunQueued(RunId),
    CancelRun(RunId),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global cap on concurrently running jobs.
    pub max_concurrent: usize,
    /// How often the store queue is polled for pending runs.
    pub poll_interval: Duration,
    /// Grace period for in-flight jobs on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Cheap handle for the API layer and CLI.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
    inflight: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl SchedulerHandle {
    pub async fn notify_run_queued(&self, run_id: RunId) {
        let _ = self.tx.send(SchedulerCommand::RunQueued(run_id)).await;
    }

    pub async fn cancel_run(&self, run_id: RunId) {
        let _ = self.tx.send(SchedulerCommand::CancelRun(run_id)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerCommand::Shutdown).await;
    }

    pub fn active_jobs(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

struct JobCompletion {
    run_id: RunId,
    job_name: String,
    outcome: JobOutcome,
}

struct ActiveRun {
    run: PipelineRun,
    dag: JobDag,
    jobs: HashMap<String, Job>,
    steps: HashMap<String, Vec<Step>>,
    specs: HashMap<String, JobDefinition>,
    groups: Vec<MatrixGroup>,
    pipeline_env: HashMap<String, String>,
    cancel: Arc<AtomicBool>,
}

pub struct Scheduler {
    store: Store,
    source: Arc<dyn PipelineSource>,
    executor: Arc<dyn JobExecutor>,
    bus: Arc<LogBus>,
    config: SchedulerConfig,
    rx: mpsc::Receiver<SchedulerCommand>,
    active: HashMap<RunId, ActiveRun>,
    inflight: Arc<AtomicUsize>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        source: Arc<dyn PipelineSource>,
        executor: Arc<dyn JobExecutor>,
        bus: Arc<LogBus>,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(64);
        let inflight = Arc::new(AtomicUsize::new(0));
        let handle = SchedulerHandle {
            tx,
            inflight: inflight.clone(),
            max_concurrent: config.max_concurrent,
        };
        let scheduler = Self {
            store,
            source,
            executor,
            bus,
            config,
            rx,
            active: HashMap::new(),
            inflight,
        };
        (scheduler, handle)
    }

    /// The coordinator loop. Returns after a `Shutdown` command once
    /// in-flight work has drained (or the grace period expires).
    pub async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::channel::<JobCompletion>(64);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(max_concurrent = self.config.max_concurrent, "scheduler started");

        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(SchedulerCommand::RunQueued(run_id)) => self.start_run(run_id).await,
                    Some(SchedulerCommand::CancelRun(run_id)) => self.cancel_run(run_id).await,
                    Some(SchedulerCommand::Shutdown) | None => break,
                },
                Some(done) = done_rx.recv() => self.handle_completion(done).await,
                _ = poll.tick() => self.pickup_pending().await,
            }
            self.dispatch_ready(&done_tx).await;
        }

        self.drain(&mut done_rx).await;
        self.executor.shutdown().await;
        info!("scheduler stopped");
    }

    async fn pickup_pending(&mut self) {
        let pending = match self.store.pending_runs(16).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "pending-run poll failed");
                return;
            }
        };
        for run in pending {
            self.start_run(run.id).await;
        }
    }

    async fn start_run(&mut self, run_id: RunId) {
        if self.active.contains_key(&run_id) {
            return;
        }
        let run = match self.store.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!(run_id = %run_id, "queued run does not exist");
                return;
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "run lookup failed");
                return;
            }
        };
        if run.status != Status::Pending && run.status != Status::Queued {
            return;
        }

        match self.init_run(&run).await {
            Ok(active) => {
                info!(run_id = %run_id, pipeline = %run.pipeline_name, "run started");
                self.active.insert(run_id, active);
            }
            Err(e) => {
                // ConfigInvalid and DependencyCycle surface to the run and
                // are never retried.
                error!(run_id = %run_id, error = %e, "run initialization failed");
                let _ = self
                    .store
                    .update_run_status(run_id, Status::Failure, Some(Utc::now()), Some(Utc::now()))
                    .await;
            }
        }
    }

    async fn init_run(&mut self, run: &PipelineRun) -> Result<ActiveRun> {
        let project = self
            .store
            .get_project(run.project_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("project missing for run {}", run.id)))?;

        let definition = self.source.resolve(&project, &run.pipeline_name).await?;
        let expanded = expand_pipeline(&definition);
        if expanded.jobs.is_empty() {
            return Err(Error::InvalidPipeline("pipeline has no jobs".to_string()));
        }

        let dag = JobDag::build(expanded.jobs.iter().map(|job| {
            (
                job.name.as_str(),
                job.depends_on.iter().map(String::as_str).collect(),
            )
        }))
        .map_err(|e| match e {
            DagError::CycleDetected => Error::DependencyCycle(run.pipeline_name.clone()),
            DagError::UnknownDependency(dep) => Error::UnknownDependency(dep),
            other => Error::InvalidPipeline(other.to_string()),
        })?;

        let mut jobs = HashMap::new();
        let mut steps = HashMap::new();
        let mut specs = HashMap::new();
        for spec in &expanded.jobs {
            let job = self
                .store
                .create_job(run.id, &spec.name, &spec.runner.image)
                .await?;
            let mut rows = Vec::with_capacity(spec.steps.len());
            for (order, step) in spec.steps.iter().enumerate() {
                rows.push(
                    self.store
                        .create_step(job.id, &step.name, order as u32)
                        .await?,
                );
            }
            jobs.insert(spec.name.clone(), job);
            steps.insert(spec.name.clone(), rows);
            specs.insert(spec.name.clone(), spec.clone());
        }

        self.store
            .update_run_status(run.id, Status::Running, Some(Utc::now()), None)
            .await?;

        let mut active = ActiveRun {
            run: run.clone(),
            dag,
            jobs,
            steps,
            specs,
            groups: expanded.groups,
            pipeline_env: definition.env.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        };

        // Jobs whose condition resolved to false settle immediately as
        // skipped; their dependents still run. Topological order makes
        // chains of disabled jobs cascade correctly.
        for name in active.dag.topological_order() {
            let enabled = active.specs.get(&name).map(|s| s.enabled).unwrap_or(true);
            if !enabled {
                self.persist_job_status(&active, &name, Status::Skipped, None)
                    .await;
                active.dag.mark_completed(&name, true);
            }
        }

        Ok(active)
    }

    async fn dispatch_ready(&mut self, done_tx: &mpsc::Sender<JobCompletion>) {
        while self.inflight.load(Ordering::SeqCst) < self.config.max_concurrent {
            let Some((run_id, job_name)) = self.next_dispatch() else {
                return;
            };

            // Snapshot everything before any await so the run-map borrow
            // does not span a suspension point.
            let request = {
                let Some(active) = self.active.get_mut(&run_id) else {
                    continue;
                };
                if !active.dag.mark_running(&job_name) {
                    continue;
                }
                JobRequest {
                    job: active.jobs[&job_name].clone(),
                    steps: active.steps[&job_name].clone(),
                    spec: active.specs[&job_name].clone(),
                    pipeline_env: active.pipeline_env.clone(),
                    cancel: active.cancel.clone(),
                }
            };

            let job = request.job.clone();
            if let Err(e) = self
                .store
                .update_job_status(job.id, Status::Running, Some(Utc::now()), None, None)
                .await
            {
                warn!(job = %job_name, error = %e, "job status persist failed");
            }
            self.bus.publish(
                job.id,
                JobEvent::StatusChanged(JobStatusChange {
                    run_id,
                    job_id: job.id,
                    status: Status::Running,
                    exit_code: None,
                    timestamp: Utc::now(),
                }),
            );

            debug!(run_id = %run_id, job = %job_name, "dispatching job");
            self.inflight.fetch_add(1, Ordering::SeqCst);
            let executor = self.executor.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let outcome = executor.execute(request).await;
                let _ = done_tx
                    .send(JobCompletion {
                        run_id,
                        job_name,
                        outcome,
                    })
                    .await;
            });
        }
    }

    /// FIFO across runs by `created_at`, then job-name order within a run.
    fn next_dispatch(&self) -> Option<(RunId, String)> {
        let mut runs: Vec<&ActiveRun> = self.active.values().collect();
        runs.sort_by_key(|a| a.run.created_at);

        for active in runs {
            for name in active.dag.ready() {
                if self.group_blocked(active, &name) {
                    continue;
                }
                return Some((active.run.id, name));
            }
        }
        None
    }

    /// Matrix `max_parallel` admission within one group.
    fn group_blocked(&self, active: &ActiveRun, job_name: &str) -> bool {
        active
            .groups
            .iter()
            .filter(|group| group.job_names.iter().any(|n| n == job_name))
            .any(|group| match group.max_parallel {
                Some(max) => {
                    let running = group
                        .job_names
                        .iter()
                        .filter(|n| active.dag.status(n) == Some(NodeStatus::Running))
                        .count();
                    running >= max as usize
                }
                None => false,
            })
    }

    async fn handle_completion(&mut self, done: JobCompletion) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);

        let Some(job) = self
            .active
            .get(&done.run_id)
            .and_then(|active| active.jobs.get(&done.job_name).cloned())
        else {
            return;
        };

        if let Some(reason) = &done.outcome.reason {
            debug!(job = %done.job_name, reason = %reason, "job finished with reason");
        }

        if let Err(e) = self
            .store
            .update_job_status(
                job.id,
                done.outcome.status,
                None,
                Some(Utc::now()),
                done.outcome.exit_code,
            )
            .await
        {
            warn!(job = %done.job_name, error = %e, "completion persist failed");
        }
        self.bus.publish(
            job.id,
            JobEvent::StatusChanged(JobStatusChange {
                run_id: done.run_id,
                job_id: job.id,
                status: done.outcome.status,
                exit_code: done.outcome.exit_code,
                timestamp: Utc::now(),
            }),
        );
        self.bus.retire(job.id);

        let effect = {
            let Some(active) = self.active.get_mut(&done.run_id) else {
                return;
            };
            match done.outcome.status {
                Status::Success => active.dag.mark_completed(&done.job_name, true),
                Status::Cancelled => active.dag.mark_cancelled(&done.job_name),
                _ => active.dag.mark_completed(&done.job_name, false),
            }
        };

        let run_id = done.run_id;
        for name in &effect.skipped {
            self.persist_active_job_status(run_id, name, Status::Skipped, None)
                .await;
        }

        if done.outcome.status == Status::Failure {
            self.apply_fail_fast(run_id, &done.job_name).await;
        }

        self.maybe_finalize(run_id).await;
    }

    /// Cancel ready/pending members of a failed job's fail-fast group.
    /// Running members are left to finish.
    async fn apply_fail_fast(&mut self, run_id: RunId, failed_job: &str) {
        let Some(active) = self.active.get_mut(&run_id) else {
            return;
        };
        let members: Vec<String> = active
            .groups
            .iter()
            .filter(|g| g.fail_fast && g.job_names.iter().any(|n| n == failed_job))
            .flat_map(|g| g.job_names.clone())
            .filter(|n| n != failed_job)
            .collect();

        for member in members {
            let effect = {
                let Some(active) = self.active.get_mut(&run_id) else {
                    return;
                };
                match active.dag.status(&member) {
                    Some(NodeStatus::Pending) | Some(NodeStatus::Ready) => {
                        active.dag.cancel_node(&member)
                    }
                    _ => continue,
                }
            };

            self.persist_active_job_status(run_id, &member, Status::Cancelled, None)
                .await;
            for name in &effect.skipped {
                self.persist_active_job_status(run_id, name, Status::Skipped, None)
                    .await;
            }
        }
    }

    async fn cancel_run(&mut self, run_id: RunId) {
        let Some(active) = self.active.get_mut(&run_id) else {
            // Not active: a still-pending run can be cancelled directly.
            match self.store.get_run(run_id).await {
                Ok(Some(run)) if !run.status.is_terminal() => {
                    let _ = self
                        .store
                        .update_run_status(run_id, Status::Cancelled, None, Some(Utc::now()))
                        .await;
                }
                _ => {}
            }
            return;
        };

        info!(run_id = %run_id, "cancelling run");
        active.cancel.store(true, Ordering::SeqCst);
        let cancelled = active.dag.cancel_all();
        for name in cancelled {
            self.persist_active_job_status(run_id, &name, Status::Cancelled, None)
                .await;
        }
        self.maybe_finalize(run_id).await;
    }

    async fn maybe_finalize(&mut self, run_id: RunId) {
        let Some(active) = self.active.get(&run_id) else {
            return;
        };
        if !active.dag.is_complete() {
            return;
        }

        let status = if active.dag.has_status(NodeStatus::Failure) {
            Status::Failure
        } else if active.dag.has_status(NodeStatus::Cancelled) {
            Status::Cancelled
        } else {
            Status::Success
        };

        if let Err(e) = self
            .store
            .update_run_status(run_id, status, None, Some(Utc::now()))
            .await
        {
            warn!(run_id = %run_id, error = %e, "run finalize persist failed");
        }
        info!(run_id = %run_id, status = %status, "run finished");
        self.active.remove(&run_id);
    }

    async fn drain(&mut self, done_rx: &mut mpsc::Receiver<JobCompletion>) {
        let run_ids: Vec<RunId> = self.active.keys().copied().collect();
        for run_id in run_ids {
            self.cancel_run(run_id).await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.inflight.load(Ordering::SeqCst) > 0 {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(
                    inflight = self.inflight.load(Ordering::SeqCst),
                    "shutdown grace expired with jobs in flight"
                );
                break;
            }
            match tokio::time::timeout(remaining, done_rx.recv()).await {
                Ok(Some(done)) => self.handle_completion(done).await,
                _ => break,
            }
        }
    }

    async fn persist_active_job_status(
        &self,
        run_id: RunId,
        job_name: &str,
        status: Status,
        exit_code: Option<i32>,
    ) {
        let Some(active) = self.active.get(&run_id) else {
            return;
        };
        self.persist_job_status(active, job_name, status, exit_code)
            .await;
    }

    /// Persist a settled-without-running status (skipped/cancelled) for a
    /// job and all of its steps.
    async fn persist_job_status(
        &self,
        active: &ActiveRun,
        job_name: &str,
        status: Status,
        exit_code: Option<i32>,
    ) {
        let Some(job) = active.jobs.get(job_name) else {
            return;
        };
        if let Err(e) = self
            .store
            .update_job_status(job.id, status, None, Some(Utc::now()), exit_code)
            .await
        {
            warn!(job = %job_name, error = %e, "status persist failed");
        }
        if let Some(rows) = active.steps.get(job_name) {
            for row in rows {
                let _ = self.store.update_step_status(row.id, status, None).await;
            }
        }
        self.bus.publish(
            job.id,
            JobEvent::StatusChanged(JobStatusChange {
                run_id: active.run.id,
                job_id: job.id,
                status,
                exit_code,
                timestamp: Utc::now(),
            }),
        );
        self.bus.retire(job.id);
    }
}
