//! Hypervisor process supervision.
//!
//! One `VmInstance` per job: spawn the Firecracker binary, wait for its API
//! socket, apply the full `VmConfig`, start, and later tear everything down.
//! Instances are owned by the manager; a handle is lent to exactly one
//! executor at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use zephyr_core::ids::VmId;
use zephyr_core::{Error, Result};

use crate::api::HypervisorClient;
use crate::config::{VmConfig, VmPaths};

const SOCKET_WAIT: Duration = Duration::from_secs(5);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const API_READY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Configuring,
    Running,
    Stopped,
    Error,
}

/// A live microVM owned by the manager.
#[derive(Debug)]
pub struct VmInstance {
    pub id: VmId,
    pub state: VmState,
    pub paths: VmPaths,
    pub api: HypervisorClient,
    process: Child,
}

impl VmInstance {
    pub fn vsock_socket(&self) -> &std::path::Path {
        &self.paths.vsock_socket
    }
}

#[derive(Debug, Clone)]
pub struct VmManagerConfig {
    /// Path of the hypervisor binary.
    pub firecracker_bin: PathBuf,
    /// Directory for API sockets, vsock sockets and VM logs.
    pub runtime_dir: PathBuf,
    /// Hypervisor log level passed via `--level`.
    pub log_level: String,
    /// Grace period for ctrl-alt-del before SIGKILL.
    pub stop_timeout: Duration,
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            firecracker_bin: PathBuf::from("firecracker"),
            runtime_dir: PathBuf::from("/var/run/zephyr"),
            log_level: "Warn".to_string(),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns the set of live VMs.
pub struct VmManager {
    config: VmManagerConfig,
    instances: Mutex<HashMap<VmId, Arc<Mutex<VmInstance>>>>,
}

impl VmManager {
    pub fn new(config: VmManagerConfig) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn and fully configure a VM. The instance is returned in
    /// `Configuring` state; callers must `start` it, and must `destroy` it
    /// if any error is returned after this point.
    pub async fn create(&self, vm_id: VmId, vm_config: &VmConfig) -> Result<Arc<Mutex<VmInstance>>> {
        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;

        let paths = VmPaths::in_dir(&self.config.runtime_dir, &vm_id);

        // A stale socket from a crashed process makes the hypervisor refuse
        // to bind.
        let _ = tokio::fs::remove_file(&paths.api_socket).await;
        let _ = tokio::fs::remove_file(&paths.vsock_socket).await;

        let mut process = Command::new(&self.config.firecracker_bin)
            .arg("--api-sock")
            .arg(&paths.api_socket)
            .arg("--level")
            .arg(&self.config.log_level)
            .arg("--log-path")
            .arg(&paths.log_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::HypervisorStartFailed(format!("spawn failed: {e}")))?;

        if let Err(e) = wait_for_socket(&paths.api_socket, &mut process).await {
            let _ = process.kill().await;
            return Err(e);
        }

        let api = HypervisorClient::new(&paths.api_socket);
        if let Err(e) = wait_for_api(&api).await {
            let _ = process.kill().await;
            return Err(e);
        }

        let instance = Arc::new(Mutex::new(VmInstance {
            id: vm_id,
            state: VmState::Configuring,
            paths,
            api: api.clone(),
            process,
        }));
        self.instances.lock().await.insert(vm_id, instance.clone());

        if let Err(e) = self.configure(&api, vm_config).await {
            // Caller must destroy; record the error state for diagnostics.
            instance.lock().await.state = VmState::Error;
            return Err(e);
        }

        info!(vm_id = %vm_id, "VM configured");
        Ok(instance)
    }

    /// `Configuring -> Running` via InstanceStart.
    pub async fn start(&self, vm_id: VmId) -> Result<()> {
        let instance = self.get(vm_id).await?;
        let mut guard = instance.lock().await;

        if guard.state != VmState::Configuring {
            return Err(Error::Internal(format!(
                "VM {vm_id} cannot start from {:?}",
                guard.state
            )));
        }

        // Process death before start is a fatal VM error.
        if let Some(status) = guard
            .process
            .try_wait()
            .map_err(|e| Error::HypervisorStartFailed(e.to_string()))?
        {
            guard.state = VmState::Error;
            return Err(Error::HypervisorStartFailed(format!(
                "hypervisor exited before start: {status}"
            )));
        }

        guard.api.instance_start().await?;
        guard.state = VmState::Running;
        info!(vm_id = %vm_id, "VM started");
        Ok(())
    }

    /// Graceful stop: ctrl-alt-del, then SIGKILL after the timeout.
    /// Idempotent if the VM is already stopped.
    pub async fn stop(&self, vm_id: VmId, stop_timeout: Option<Duration>) -> Result<()> {
        let instance = self.get(vm_id).await?;
        let mut guard = instance.lock().await;

        if guard.state != VmState::Running {
            return Ok(());
        }

        if let Err(e) = guard.api.send_ctrl_alt_del().await {
            debug!(vm_id = %vm_id, error = %e, "ctrl-alt-del failed, killing");
        }

        let deadline = stop_timeout.unwrap_or(self.config.stop_timeout);
        match timeout(deadline, guard.process.wait()).await {
            Ok(Ok(status)) => {
                debug!(vm_id = %vm_id, %status, "VM exited");
            }
            Ok(Err(e)) => {
                warn!(vm_id = %vm_id, error = %e, "wait failed, killing");
                let _ = guard.process.kill().await;
            }
            Err(_) => {
                warn!(vm_id = %vm_id, "graceful stop timed out, killing");
                let _ = guard.process.kill().await;
            }
        }

        guard.state = VmState::Stopped;
        Ok(())
    }

    /// Stop if needed, kill if still alive, remove sockets, unregister.
    /// Safe to call more than once.
    pub async fn destroy(&self, vm_id: VmId) -> Result<()> {
        let instance = match self.instances.lock().await.remove(&vm_id) {
            Some(i) => i,
            None => return Ok(()),
        };
        let mut guard = instance.lock().await;

        if guard.state == VmState::Running {
            let _ = guard.api.send_ctrl_alt_del().await;
            if timeout(self.config.stop_timeout, guard.process.wait())
                .await
                .is_err()
            {
                let _ = guard.process.kill().await;
            }
        } else {
            let _ = guard.process.kill().await;
        }

        let _ = tokio::fs::remove_file(&guard.paths.api_socket).await;
        let _ = tokio::fs::remove_file(&guard.paths.vsock_socket).await;
        guard.state = VmState::Stopped;

        info!(vm_id = %vm_id, "VM destroyed");
        Ok(())
    }

    /// Destroy every remaining VM. Used on global shutdown.
    pub async fn destroy_all(&self) {
        let ids: Vec<VmId> = self.instances.lock().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.destroy(id).await {
                warn!(vm_id = %id, error = %e, "destroy during shutdown failed");
            }
        }
    }

    pub async fn live_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    async fn get(&self, vm_id: VmId) -> Result<Arc<Mutex<VmInstance>>> {
        self.instances
            .lock()
            .await
            .get(&vm_id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("unknown VM: {vm_id}")))
    }

    /// Apply the full configuration in dependency order.
    async fn configure(&self, api: &HypervisorClient, config: &VmConfig) -> Result<()> {
        api.put_boot_source(&config.boot_source).await?;
        api.put_machine_config(&config.machine).await?;
        for drive in &config.drives {
            api.put_drive(drive).await?;
        }
        for iface in &config.network_interfaces {
            api.put_network_interface(iface).await?;
        }
        if let Some(vsock) = &config.vsock {
            api.put_vsock(vsock).await?;
        }
        if let Some(logger) = &config.logger {
            api.put_logger(logger).await?;
        }
        if let Some(metrics) = &config.metrics {
            api.put_metrics(metrics).await?;
        }
        if let Some(mmds) = &config.mmds {
            api.put_mmds(mmds).await?;
        }
        if let Some(balloon) = &config.balloon {
            api.put_balloon(balloon).await?;
        }
        Ok(())
    }
}

async fn wait_for_socket(path: &std::path::Path, process: &mut Child) -> Result<()> {
    let deadline = Instant::now() + SOCKET_WAIT;
    loop {
        if path.exists() {
            return Ok(());
        }
        if let Some(status) = process
            .try_wait()
            .map_err(|e| Error::HypervisorStartFailed(e.to_string()))?
        {
            return Err(Error::HypervisorStartFailed(format!(
                "hypervisor exited during startup: {status}"
            )));
        }
        if Instant::now() >= deadline {
            return Err(Error::HypervisorStartFailed(format!(
                "API socket {} did not appear within {:?}",
                path.display(),
                SOCKET_WAIT
            )));
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
}

async fn wait_for_api(api: &HypervisorClient) -> Result<()> {
    let deadline = Instant::now() + API_READY_WAIT;
    loop {
        match api.describe_instance().await {
            Ok(_) => return Ok(()),
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::HypervisorStartFailed(format!(
                    "API not ready within {API_READY_WAIT:?}: {e}"
                )));
            }
            Err(_) => sleep(SOCKET_POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destroy_unknown_vm_is_idempotent() {
        let manager = VmManager::new(VmManagerConfig::default());
        let id = VmId::new();
        manager.destroy(id).await.unwrap();
        manager.destroy(id).await.unwrap();
        assert_eq!(manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_fails_without_binary() {
        let manager = VmManager::new(VmManagerConfig {
            firecracker_bin: PathBuf::from("/nonexistent/firecracker"),
            runtime_dir: std::env::temp_dir().join(format!("zeph-mgr-{}", uuid::Uuid::new_v4())),
            ..VmManagerConfig::default()
        });

        let config = VmConfig {
            boot_source: crate::config::BootSource {
                kernel_image_path: "/vmlinux".to_string(),
                boot_args: None,
                initrd_path: None,
            },
            machine: crate::config::MachineConfig {
                vcpu_count: 1,
                mem_size_mib: 128,
                smt: None,
                cpu_template: None,
            },
            drives: vec![],
            network_interfaces: vec![],
            vsock: None,
            logger: None,
            metrics: None,
            mmds: None,
            balloon: None,
        };

        let err = manager.create(VmId::new(), &config).await.unwrap_err();
        assert!(matches!(err, Error::HypervisorStartFailed(_)));
    }
}
