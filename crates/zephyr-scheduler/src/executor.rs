//! Per-job VM executor.
//!
//! Runs exactly one job: allocate a /30, boot a microVM, wait for the
//! in-guest agent, push the workspace, drive the steps in order, then tear
//! everything down. The scheduler owns the DAG; this code only reports the
//! job's terminal status back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zephyr_core::events::{JobEvent, OutputChunk};
use zephyr_core::ids::{StepId, VmId};
use zephyr_core::pipeline::{JobDefinition, RetrySpec, StepDefinition};
use zephyr_core::run::{Job, LogStream, Status, Step};
use zephyr_core::{Error, Result};
use zephyr_agent::protocol::AGENT_VSOCK_PORT;
use zephyr_agent::{AgentClient, OutputStream, AGENT_PORT};
use zephyr_store::Store;
use zephyr_vm::config::VmPaths;
use zephyr_vm::{
    BootSource, Drive, MachineConfig, NetworkAllocator, NetworkConfig, NetworkInterface,
    VmConfig, VmManager, VsockDevice,
};

use crate::logbus::LogBus;

/// Everything an executor needs to run one job.
pub struct JobRequest {
    pub job: Job,
    /// Store rows for the job's steps, in order.
    pub steps: Vec<Step>,
    /// The expanded definition the steps came from.
    pub spec: JobDefinition,
    /// Pipeline-level environment, overridden by job and step env.
    pub pipeline_env: HashMap<String, String>,
    /// Cancellation intent, observed before each step dispatch.
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: Status,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            exit_code: Some(0),
            reason: None,
        }
    }

    pub fn failure(exit_code: i32, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Failure,
            exit_code: Some(exit_code),
            reason: Some(reason.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            exit_code: None,
            reason: None,
        }
    }
}

/// Seam between the scheduler and job execution, so scheduling logic is
/// testable without a hypervisor.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, request: JobRequest) -> JobOutcome;

    /// Called once on global shutdown, after in-flight jobs finished.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct VmExecutorConfig {
    /// Directory for per-VM sockets and logs.
    pub runtime_dir: PathBuf,
    /// Kernel used when the runner spec does not name one.
    pub kernel_image: PathBuf,
    /// Root filesystems live here as `<image>.ext4`.
    pub rootfs_dir: PathBuf,
    /// Host directory whose contents are pushed into the guest workspace.
    pub workspace_dir: Option<PathBuf>,
    /// Canonical in-guest workspace path.
    pub guest_workspace: String,
    pub agent_ready_timeout: Duration,
}

impl Default for VmExecutorConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from("/var/run/zephyr"),
            kernel_image: PathBuf::from("/var/lib/zephyr/images/vmlinux"),
            rootfs_dir: PathBuf::from("/var/lib/zephyr/images"),
            workspace_dir: None,
            guest_workspace: "/workspace".to_string(),
            agent_ready_timeout: Duration::from_secs(30),
        }
    }
}

pub struct VmJobExecutor {
    config: VmExecutorConfig,
    store: Store,
    bus: Arc<LogBus>,
    network: Arc<NetworkAllocator>,
    vms: Arc<VmManager>,
}

impl VmJobExecutor {
    pub fn new(
        config: VmExecutorConfig,
        store: Store,
        bus: Arc<LogBus>,
        network: Arc<NetworkAllocator>,
        vms: Arc<VmManager>,
    ) -> Self {
        Self {
            config,
            store,
            bus,
            network,
            vms,
        }
    }

    async fn run_attempt(&self, request: &JobRequest) -> JobOutcome {
        let vm_id = VmId::new();

        let netcfg = match self.network.allocate(vm_id).await {
            Ok(cfg) => cfg,
            Err(e) => return JobOutcome::failure(-1, format!("network setup failed: {e}")),
        };

        let outcome = self
            .run_in_vm(request, vm_id, &netcfg)
            .await
            .unwrap_or_else(|e| JobOutcome::failure(-1, e.to_string()));

        // Teardown runs whatever happened above.
        if let Err(e) = self.vms.destroy(vm_id).await {
            warn!(vm_id = %vm_id, error = %e, "VM destroy failed");
        }
        if let Err(e) = self.network.release(&netcfg).await {
            warn!(vm_id = %vm_id, error = %e, "network release failed");
        }

        outcome
    }

    async fn run_in_vm(
        &self,
        request: &JobRequest,
        vm_id: VmId,
        netcfg: &NetworkConfig,
    ) -> Result<JobOutcome> {
        let paths = VmPaths::in_dir(&self.config.runtime_dir, &vm_id);
        let vm_config = self.build_vm_config(&request.spec, netcfg, &paths);

        self.vms.create(vm_id, &vm_config).await?;
        self.vms.start(vm_id).await?;

        let vsock_path = paths.vsock_socket.clone();
        let tcp_addr = SocketAddr::from((netcfg.guest_ip, AGENT_PORT));
        let mut client = AgentClient::wait_ready(
            move || {
                let vsock_path = vsock_path.clone();
                async move {
                    match AgentClient::connect_vsock(&vsock_path, AGENT_VSOCK_PORT).await {
                        Ok(client) => Ok(client),
                        Err(_) => AgentClient::connect_tcp(tcp_addr).await,
                    }
                }
            },
            self.config.agent_ready_timeout,
        )
        .await
        .map_err(|_| Error::AgentUnreachable(format!("agent unreachable in {vm_id}")))?;

        info!(vm_id = %vm_id, job = %request.job.name, "agent ready");

        self.push_workspace(&mut client).await?;

        let outcome = self.run_steps(request, &mut client).await?;

        let _ = client.shutdown(Some(10)).await;
        if let Err(e) = self.vms.stop(vm_id, None).await {
            debug!(vm_id = %vm_id, error = %e, "graceful stop failed, destroy will kill");
        }

        Ok(outcome)
    }

    fn build_vm_config(
        &self,
        spec: &JobDefinition,
        netcfg: &NetworkConfig,
        paths: &VmPaths,
    ) -> VmConfig {
        let kernel = spec
            .runner
            .kernel
            .clone()
            .unwrap_or_else(|| self.config.kernel_image.to_string_lossy().into_owned());
        let rootfs = spec.runner.rootfs.clone().unwrap_or_else(|| {
            self.config
                .rootfs_dir
                .join(format!("{}.ext4", spec.runner.image))
                .to_string_lossy()
                .into_owned()
        });

        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off {} nameserver={}",
            netcfg.guest_boot_arg(),
            netcfg.dns
        );

        VmConfig {
            boot_source: BootSource {
                kernel_image_path: kernel,
                boot_args: Some(boot_args),
                initrd_path: None,
            },
            machine: MachineConfig {
                vcpu_count: spec.runner.vcpus,
                mem_size_mib: spec.runner.memory_mib,
                smt: None,
                cpu_template: None,
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs,
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: netcfg.guest_mac.clone(),
                host_dev_name: netcfg.tap_device.clone(),
            }],
            vsock: Some(VsockDevice {
                guest_cid: 3,
                uds_path: paths.vsock_socket.to_string_lossy().into_owned(),
            }),
            logger: None,
            metrics: None,
            mmds: None,
            balloon: None,
        }
    }

    async fn push_workspace(&self, client: &mut AgentClient) -> Result<()> {
        let Some(root) = &self.config.workspace_dir else {
            return Ok(());
        };
        if !root.exists() {
            return Ok(());
        }

        for (relative, bytes) in collect_files(root).await? {
            let guest_path = format!("{}/{}", self.config.guest_workspace, relative);
            client.file_write(&guest_path, &bytes, None).await?;
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        request: &JobRequest,
        client: &mut AgentClient,
    ) -> Result<JobOutcome> {
        let job_id = request.job.id;

        // Chunks flow through this channel so the durable append and the
        // live fan-out stay ordered without blocking the agent reader. The
        // Flush marker lets the step loop wait until a step's chunks are
        // durable before its terminal status is written.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<LogMessage>();
        let store = self.store.clone();
        let bus = self.bus.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = chunk_rx.recv().await {
                let (step_id, stream, content) = match message {
                    LogMessage::Chunk(step_id, stream, content) => (step_id, stream, content),
                    LogMessage::Flush(ack) => {
                        let _ = ack.send(());
                        continue;
                    }
                };
                match store
                    .append_log(job_id, step_id, stream, content.as_bytes())
                    .await
                {
                    Ok(seq) => {
                        bus.publish(
                            job_id,
                            JobEvent::Output(OutputChunk {
                                job_id,
                                step_id,
                                stream,
                                content,
                                seq,
                                timestamp: Utc::now(),
                            }),
                        );
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "log append failed"),
                }
            }
        });

        let mut base_env = request.pipeline_env.clone();
        base_env.extend(request.spec.env.clone());

        let mut failed = false;
        let mut job_exit_code = 0;
        let mut cancelled = false;

        for (row, step) in request.steps.iter().zip(request.spec.steps.iter()) {
            if request.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                self.store
                    .update_step_status(row.id, Status::Cancelled, None)
                    .await?;
                continue;
            }

            if !step.enabled {
                self.store
                    .update_step_status(row.id, Status::Skipped, None)
                    .await?;
                continue;
            }

            if failed && !step.continue_on_error {
                self.store
                    .update_step_status(row.id, Status::Skipped, None)
                    .await?;
                continue;
            }

            self.store
                .update_step_status(row.id, Status::Running, None)
                .await?;

            let result = self
                .run_one_step(client, step, &base_env, row.id, &chunk_tx)
                .await;

            // Step chunks must be durable before the terminal status.
            let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
            if chunk_tx.send(LogMessage::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }

            let exit_code = match result {
                Ok(code) => code,
                Err(e) => {
                    // The agent (or the VM under it) is gone; nothing later
                    // in this job can run.
                    warn!(job = %request.job.name, step = %step.name, error = %e, "step aborted");
                    self.store
                        .update_step_status(row.id, Status::Failure, Some(-1))
                        .await?;
                    failed = true;
                    job_exit_code = -1;
                    break;
                }
            };

            let step_status = if exit_code == 0 {
                Status::Success
            } else {
                Status::Failure
            };
            self.store
                .update_step_status(row.id, step_status, Some(exit_code))
                .await?;

            if exit_code != 0 {
                debug!(job = %request.job.name, step = %step.name, exit_code, "step failed");
                if !step.continue_on_error {
                    failed = true;
                    job_exit_code = exit_code;
                }
            }
        }

        drop(chunk_tx);
        let _ = writer.await;

        if cancelled {
            return Ok(JobOutcome::cancelled());
        }
        if failed {
            return Ok(JobOutcome::failure(job_exit_code, "step failed"));
        }
        Ok(JobOutcome::success())
    }

    async fn run_one_step(
        &self,
        client: &mut AgentClient,
        step: &StepDefinition,
        base_env: &HashMap<String, String>,
        step_id: StepId,
        chunk_tx: &mpsc::UnboundedSender<LogMessage>,
    ) -> Result<i32> {
        let mut env = base_env.clone();
        env.extend(step.env.clone());

        let cwd = step
            .cwd
            .clone()
            .unwrap_or_else(|| self.config.guest_workspace.clone());

        let outcome = client
            .execute(
                &step.run,
                &step.args,
                Some(&cwd),
                &env,
                step.timeout_secs.map(Duration::from_secs),
                |stream, data| {
                    let _ = chunk_tx.send(LogMessage::Chunk(
                        Some(step_id),
                        to_log_stream(stream),
                        data.to_string(),
                    ));
                },
            )
            .await?;

        Ok(outcome.exit_code)
    }

    /// Settle any step row the attempt never drove to a terminal status,
    /// so a terminal job implies terminal steps.
    async fn finalize_steps(&self, request: &JobRequest, outcome: &JobOutcome) {
        let Ok(rows) = self.store.steps_for_job(request.job.id).await else {
            return;
        };
        let settle = match outcome.status {
            Status::Cancelled => Status::Cancelled,
            _ => Status::Skipped,
        };
        for row in rows {
            if !row.status.is_terminal() {
                let _ = self.store.update_step_status(row.id, settle, None).await;
            }
        }
    }
}

enum LogMessage {
    Chunk(Option<StepId>, LogStream, String),
    Flush(tokio::sync::oneshot::Sender<()>),
}

#[async_trait]
impl JobExecutor for VmJobExecutor {
    async fn execute(&self, request: JobRequest) -> JobOutcome {
        let retry = request.spec.retry.clone();
        let mut attempt = 1u32;

        loop {
            let outcome = self.run_attempt(&request).await;

            if !should_retry(retry.as_ref(), &outcome, attempt)
                || request.cancel.load(Ordering::SeqCst)
            {
                self.finalize_steps(&request, &outcome).await;
                return outcome;
            }

            let delay = Duration::from_secs(retry.as_ref().map(|r| r.delay_secs).unwrap_or(0));
            info!(
                job = %request.job.name,
                attempt,
                delay_secs = delay.as_secs(),
                "retrying job"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn shutdown(&self) {
        self.vms.destroy_all().await;
    }
}

/// A failed attempt retries while attempts remain and, when the retry spec
/// pins exit codes, only for those codes.
fn should_retry(retry: Option<&RetrySpec>, outcome: &JobOutcome, attempt: u32) -> bool {
    let Some(retry) = retry else {
        return false;
    };
    if outcome.status != Status::Failure || attempt >= retry.max_attempts {
        return false;
    }
    if retry.on_exit_codes.is_empty() {
        return true;
    }
    outcome
        .exit_code
        .map(|code| retry.on_exit_codes.contains(&code))
        .unwrap_or(false)
}

fn to_log_stream(stream: OutputStream) -> LogStream {
    match stream {
        OutputStream::Stdout => LogStream::Stdout,
        OutputStream::Stderr => LogStream::Stderr,
    }
}

/// Recursively gather `(relative-path, contents)` under `root`.
async fn collect_files(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else {
                let relative = path
                    .strip_prefix(root)
                    .map_err(|e| Error::Internal(e.to_string()))?
                    .to_string_lossy()
                    .into_owned();
                files.push((relative, tokio::fs::read(&path).await?));
            }
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure_outcome(code: i32) -> JobOutcome {
        JobOutcome::failure(code, "step failed")
    }

    #[test]
    fn test_no_retry_without_spec() {
        assert!(!should_retry(None, &failure_outcome(1), 1));
    }

    #[test]
    fn test_retry_until_max_attempts() {
        let retry = RetrySpec {
            max_attempts: 3,
            delay_secs: 0,
            on_exit_codes: vec![],
        };
        assert!(should_retry(Some(&retry), &failure_outcome(1), 1));
        assert!(should_retry(Some(&retry), &failure_outcome(1), 2));
        assert!(!should_retry(Some(&retry), &failure_outcome(1), 3));
    }

    #[test]
    fn test_retry_respects_exit_code_filter() {
        let retry = RetrySpec {
            max_attempts: 5,
            delay_secs: 0,
            on_exit_codes: vec![75, 137],
        };
        assert!(should_retry(Some(&retry), &failure_outcome(137), 1));
        assert!(!should_retry(Some(&retry), &failure_outcome(1), 1));
    }

    #[test]
    fn test_success_never_retries() {
        let retry = RetrySpec {
            max_attempts: 3,
            delay_secs: 0,
            on_exit_codes: vec![],
        };
        assert!(!should_retry(Some(&retry), &JobOutcome::success(), 1));
        assert!(!should_retry(Some(&retry), &JobOutcome::cancelled(), 1));
    }
}
