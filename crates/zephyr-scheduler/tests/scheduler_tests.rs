//! Scheduler behavior against an in-process executor fake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use zephyr_core::pipeline::{
    JobDefinition, MatrixSpec, PipelineDefinition, RunnerSpec, StepDefinition,
};
use zephyr_core::run::{PipelineRun, Project, Status};
use zephyr_core::Result;
use zephyr_scheduler::{
    JobExecutor, JobOutcome, JobRequest, LogBus, PipelineSource, Scheduler, SchedulerConfig,
    SchedulerHandle,
};
use zephyr_store::{RunTrigger, Store};

fn step(name: &str) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        run: format!("echo {name}"),
        args: vec![],
        cwd: None,
        env: HashMap::new(),
        timeout_secs: None,
        continue_on_error: false,
        enabled: true,
    }
}

fn job(name: &str, deps: &[&str]) -> JobDefinition {
    JobDefinition {
        name: name.to_string(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        runner: RunnerSpec {
            image: "alpine".to_string(),
            vcpus: 1,
            memory_mib: 256,
            kernel: None,
            rootfs: None,
        },
        env: HashMap::new(),
        matrix: None,
        retry: None,
        enabled: true,
        steps: vec![step("main")],
    }
}

fn pipeline(jobs: Vec<JobDefinition>) -> PipelineDefinition {
    PipelineDefinition {
        name: "ci".to_string(),
        description: None,
        triggers: vec![],
        env: HashMap::new(),
        jobs,
    }
}

struct FixedSource(PipelineDefinition);

#[async_trait]
impl PipelineSource for FixedSource {
    async fn resolve(&self, _project: &Project, _name: &str) -> Result<PipelineDefinition> {
        Ok(self.0.clone())
    }
}

/// Executor fake: records dispatch order, tracks peak concurrency, fails
/// the jobs named in `failures`.
struct FakeExecutor {
    order: Mutex<Vec<String>>,
    failures: Vec<String>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeExecutor {
    fn new(failures: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            order: Mutex::new(Vec::new()),
            failures: failures.iter().map(|f| f.to_string()).collect(),
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for FakeExecutor {
    async fn execute(&self, request: JobRequest) -> JobOutcome {
        self.order.lock().unwrap().push(request.job.name.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if request.cancel.load(Ordering::SeqCst) {
            return JobOutcome::cancelled();
        }
        if self.failures.iter().any(|f| f == &request.job.name) {
            JobOutcome::failure(1, "step failed")
        } else {
            JobOutcome::success()
        }
    }
}

async fn launch(
    definition: PipelineDefinition,
    executor: Arc<FakeExecutor>,
    max_concurrent: usize,
) -> (Store, SchedulerHandle, PipelineRun) {
    let store = Store::open_in_memory().await.unwrap();
    let project = store.create_project("demo", "zephyr.yaml").await.unwrap();
    let run = store
        .create_run(
            project.id,
            "ci",
            RunTrigger {
                trigger_type: "manual".to_string(),
                trigger_data: None,
                branch: None,
                commit_sha: None,
            },
        )
        .await
        .unwrap();

    let (scheduler, handle) = Scheduler::new(
        store.clone(),
        Arc::new(FixedSource(definition)),
        executor,
        Arc::new(LogBus::new()),
        SchedulerConfig {
            max_concurrent,
            poll_interval: Duration::from_millis(25),
            shutdown_grace: Duration::from_secs(5),
        },
    );
    tokio::spawn(scheduler.run());
    handle.notify_run_queued(run.id).await;

    (store, handle, run)
}

async fn wait_terminal(store: &Store, run_id: zephyr_core::ids::RunId) -> PipelineRun {
    for _ in 0..400 {
        let run = store.get_run(run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("run did not reach a terminal status");
}

async fn job_statuses(store: &Store, run_id: zephyr_core::ids::RunId) -> HashMap<String, Status> {
    store
        .jobs_for_run(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|j| (j.name, j.status))
        .collect()
}

#[tokio::test]
async fn test_linear_pipeline_runs_in_order() {
    let executor = FakeExecutor::new(&[], Duration::from_millis(10));
    let definition = pipeline(vec![job("a", &[]), job("b", &["a"]), job("c", &["b"])]);
    let (store, handle, run) = launch(definition, executor.clone(), 4).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Success);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());

    assert_eq!(executor.order(), vec!["a", "b", "c"]);

    let statuses = job_statuses(&store, run.id).await;
    assert!(statuses.values().all(|s| *s == Status::Success));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_fan_in_with_cap() {
    let executor = FakeExecutor::new(&[], Duration::from_millis(20));
    let definition = pipeline(vec![
        job("root", &[]),
        job("left", &["root"]),
        job("right", &["root"]),
        job("join", &["left", "right"]),
    ]);
    let (store, handle, run) = launch(definition, executor.clone(), 2).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Success);

    let order = executor.order();
    assert_eq!(order[0], "root");
    assert_eq!(order[3], "join");
    assert!(order[1..3].contains(&"left".to_string()));
    assert!(order[1..3].contains(&"right".to_string()));

    // Invariant: running jobs never exceed the cap.
    assert!(executor.peak() <= 2);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_failure_skips_dependents() {
    let executor = FakeExecutor::new(&["a"], Duration::from_millis(10));
    let definition = pipeline(vec![
        job("a", &[]),
        job("b", &["a"]),
        job("c", &["b"]),
        job("d", &[]),
    ]);
    let (store, handle, run) = launch(definition, executor.clone(), 4).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Failure);

    let statuses = job_statuses(&store, run.id).await;
    assert_eq!(statuses["a"], Status::Failure);
    assert_eq!(statuses["b"], Status::Skipped);
    assert_eq!(statuses["c"], Status::Skipped);
    assert_eq!(statuses["d"], Status::Success);

    // b and c were never handed to an executor.
    assert!(!executor.order().contains(&"b".to_string()));
    assert!(!executor.order().contains(&"c".to_string()));

    let a = store
        .jobs_for_run(run.id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.name == "a")
        .unwrap();
    assert_eq!(a.exit_code, Some(1));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_disabled_job_is_skipped_but_unblocks_dependents() {
    let executor = FakeExecutor::new(&[], Duration::from_millis(10));
    let mut disabled = job("lint", &[]);
    disabled.enabled = false;
    let definition = pipeline(vec![disabled, job("build", &["lint"])]);
    let (store, handle, run) = launch(definition, executor.clone(), 4).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Success);

    let statuses = job_statuses(&store, run.id).await;
    assert_eq!(statuses["lint"], Status::Skipped);
    assert_eq!(statuses["build"], Status::Success);
    assert_eq!(executor.order(), vec!["build"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_fail_fast_matrix_cancels_waiting_members() {
    let executor = FakeExecutor::new(&["test(v=1)"], Duration::from_millis(10));

    let mut matrix_job = job("test", &[]);
    matrix_job.matrix = Some(MatrixSpec {
        values: HashMap::from([(
            "v".to_string(),
            vec![1.into(), 2.into(), 3.into()],
        )]),
        include: vec![],
        exclude: vec![],
        // One at a time, so the failure lands before the rest dispatch.
        max_parallel: Some(1),
        fail_fast: true,
    });

    let (store, handle, run) = launch(pipeline(vec![matrix_job]), executor.clone(), 4).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Failure);

    let statuses = job_statuses(&store, run.id).await;
    assert_eq!(statuses["test(v=1)"], Status::Failure);
    assert_eq!(statuses["test(v=2)"], Status::Cancelled);
    assert_eq!(statuses["test(v=3)"], Status::Cancelled);

    assert_eq!(executor.order(), vec!["test(v=1)"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_matrix_max_parallel_serializes_group() {
    let executor = FakeExecutor::new(&[], Duration::from_millis(20));

    let mut matrix_job = job("test", &[]);
    matrix_job.matrix = Some(MatrixSpec {
        values: HashMap::from([(
            "v".to_string(),
            vec![1.into(), 2.into(), 3.into()],
        )]),
        include: vec![],
        exclude: vec![],
        max_parallel: Some(1),
        fail_fast: false,
    });

    let (store, handle, run) = launch(pipeline(vec![matrix_job]), executor.clone(), 8).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Success);
    assert!(executor.peak() <= 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_cancel_run() {
    let executor = FakeExecutor::new(&[], Duration::from_millis(300));
    let definition = pipeline(vec![job("slow", &[]), job("later", &["slow"])]);
    let (store, handle, run) = launch(definition, executor.clone(), 4).await;

    // Let the first job start, then cancel the run.
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel_run(run.id).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Cancelled);

    let statuses = job_statuses(&store, run.id).await;
    assert_eq!(statuses["slow"], Status::Cancelled);
    assert_eq!(statuses["later"], Status::Cancelled);
    assert!(!executor.order().contains(&"later".to_string()));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_dependency_cycle_fails_run() {
    let executor = FakeExecutor::new(&[], Duration::from_millis(5));
    let definition = pipeline(vec![job("a", &["b"]), job("b", &["a"])]);
    let (store, handle, run) = launch(definition, executor.clone(), 4).await;

    let finished = wait_terminal(&store, run.id).await;
    assert_eq!(finished.status, Status::Failure);
    assert!(executor.order().is_empty());

    handle.shutdown().await;
}
