//! Integration tests for the SQLite store.

use zephyr_core::run::{LogStream, Status};
use zephyr_store::{RecoverySummary, Store};

async fn store_with_run() -> (Store, zephyr_core::run::PipelineRun) {
    let store = Store::open_in_memory().await.unwrap();
    let project = store.create_project("demo", "zephyr.yaml").await.unwrap();
    let run = store
        .create_run(
            project.id,
            "ci",
            zephyr_store::RunTrigger {
                trigger_type: "manual".to_string(),
                trigger_data: None,
                branch: Some("main".to_string()),
                commit_sha: None,
            },
        )
        .await
        .unwrap();
    (store, run)
}

#[tokio::test]
async fn test_project_roundtrip() {
    let store = Store::open_in_memory().await.unwrap();
    let created = store.create_project("web", "web/zephyr.yaml").await.unwrap();

    let fetched = store.get_project(created.id).await.unwrap().unwrap();
    assert_eq!(fetched.name, "web");
    assert_eq!(fetched.config_path, "web/zephyr.yaml");

    let by_name = store.get_project_by_name("web").await.unwrap().unwrap();
    assert_eq!(by_name.id, created.id);

    assert_eq!(store.list_projects().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_lifecycle() {
    let (store, run) = store_with_run().await;
    assert_eq!(run.status, Status::Pending);

    let now = chrono::Utc::now();
    store
        .update_run_status(run.id, Status::Running, Some(now), None)
        .await
        .unwrap();
    store
        .update_run_status(run.id, Status::Success, None, Some(now))
        .await
        .unwrap();

    let fetched = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, Status::Success);
    assert!(fetched.started_at.is_some());
    assert!(fetched.finished_at.is_some());

    // Terminal runs are never mutated again.
    store
        .update_run_status(run.id, Status::Running, None, None)
        .await
        .unwrap();
    let fetched = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, Status::Success);
}

#[tokio::test]
async fn test_pending_jobs_fifo() {
    let (store, run) = store_with_run().await;

    let first = store.create_job(run.id, "a", "alpine").await.unwrap();
    let second = store.create_job(run.id, "b", "alpine").await.unwrap();

    let pending = store.pending_jobs(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, first.id);
    assert_eq!(pending[1].id, second.id);

    let next = store.next_pending_job().await.unwrap().unwrap();
    assert_eq!(next.id, first.id);
}

#[tokio::test]
async fn test_count_jobs_by_status() {
    let (store, run) = store_with_run().await;
    let a = store.create_job(run.id, "a", "alpine").await.unwrap();
    store.create_job(run.id, "b", "alpine").await.unwrap();

    store
        .update_job_status(a.id, Status::Running, Some(chrono::Utc::now()), None, None)
        .await
        .unwrap();

    let counts = store.count_jobs_by_status().await.unwrap();
    assert_eq!(counts.get(&Status::Pending), Some(&1));
    assert_eq!(counts.get(&Status::Running), Some(&1));
}

#[tokio::test]
async fn test_log_sequence_ordering() {
    let (store, run) = store_with_run().await;
    let job = store.create_job(run.id, "build", "alpine").await.unwrap();
    let step = store.create_step(job.id, "compile", 0).await.unwrap();

    let mut seqs = Vec::new();
    for i in 0..5 {
        let seq = store
            .append_log(
                job.id,
                Some(step.id),
                LogStream::Stdout,
                format!("line {i}\n").as_bytes(),
            )
            .await
            .unwrap();
        seqs.push(seq);
    }

    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let chunks = store.logs_for_job(job.id, None).await.unwrap();
    assert_eq!(chunks.len(), 5);
    assert_eq!(chunks[0].content, "line 0\n");
    assert!(chunks.windows(2).all(|w| w[0].seq < w[1].seq));

    // Cursor skips everything at or before it.
    let tail = store.logs_for_job(job.id, Some(seqs[2])).await.unwrap();
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].content, "line 3\n");
}

#[tokio::test]
async fn test_webhook_delivery_roundtrip() {
    let (store, run) = store_with_run().await;

    let delivery = store
        .save_webhook_delivery("github", "push", r#"{"ref":"refs/heads/main"}"#, Some("sha256=ab"))
        .await
        .unwrap();
    assert!(!delivery.processed);

    let unprocessed = store.unprocessed_webhook_deliveries(10).await.unwrap();
    assert_eq!(unprocessed.len(), 1);

    store
        .mark_webhook_processed(delivery.id, Some(run.id), None)
        .await
        .unwrap();
    assert!(store
        .unprocessed_webhook_deliveries(10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_recovery_marks_orphans() {
    let (store, run) = store_with_run().await;
    let job = store.create_job(run.id, "build", "alpine").await.unwrap();

    let now = chrono::Utc::now();
    store
        .update_run_status(run.id, Status::Running, Some(now), None)
        .await
        .unwrap();
    store
        .update_job_status(job.id, Status::Running, Some(now), None, None)
        .await
        .unwrap();

    let summary = store.recover_orphans().await.unwrap();
    assert_eq!(
        summary,
        RecoverySummary {
            failed_jobs: 1,
            failed_runs: 1,
            requeued_runs: 0,
        }
    );

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, Status::Failure);
    assert_eq!(job.exit_code, Some(-1));

    let run = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, Status::Failure);
}

#[tokio::test]
async fn test_recovery_requeues_unstarted_runs() {
    let (store, run) = store_with_run().await;
    store.create_job(run.id, "build", "alpine").await.unwrap();

    store
        .update_run_status(run.id, Status::Queued, None, None)
        .await
        .unwrap();

    let summary = store.recover_orphans().await.unwrap();
    assert_eq!(summary.requeued_runs, 1);
    assert_eq!(summary.failed_runs, 0);

    let run = store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, Status::Pending);

    // Stale rows are cleared so the run can be re-initialized cleanly.
    assert!(store.jobs_for_run(run.id).await.unwrap().is_empty());
}
