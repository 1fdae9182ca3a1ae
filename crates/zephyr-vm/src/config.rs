//! Firecracker resource models.
//!
//! Field names mirror the hypervisor API so these serialize directly into
//! request bodies.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete configuration applied to a VM before `InstanceStart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub boot_source: BootSource,
    pub machine: MachineConfig,
    #[serde(default)]
    pub drives: Vec<Drive>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub vsock: Option<VsockDevice>,
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub mmds: Option<serde_json::Value>,
    #[serde(default)]
    pub balloon: Option<BalloonDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockDevice {
    pub guest_cid: u32,
    pub uds_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub log_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_level: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub metrics_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalloonDevice {
    pub amount_mib: u32,
    pub deflate_on_oom: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCreateParams {
    pub snapshot_path: String,
    pub mem_file_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLoadParams {
    pub snapshot_path: String,
    pub mem_backend: MemBackend,
    #[serde(default)]
    pub resume_vm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemBackend {
    pub backend_type: String,
    pub backend_path: String,
}

/// Where on disk a VM's runtime files live.
#[derive(Debug, Clone)]
pub struct VmPaths {
    pub api_socket: PathBuf,
    pub vsock_socket: PathBuf,
    pub log_file: PathBuf,
}

impl VmPaths {
    pub fn in_dir(dir: &std::path::Path, vm_id: &zephyr_core::ids::VmId) -> Self {
        Self {
            api_socket: dir.join(format!("{vm_id}.sock")),
            vsock_socket: dir.join(format!("{vm_id}.vsock")),
            log_file: dir.join(format!("{vm_id}.log")),
        }
    }
}
