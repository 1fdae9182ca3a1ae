//! MicroVM lifecycle for Zephyr CI.
//!
//! Three layers, bottom up:
//!
//! - [`network`] allocates a /30 point-to-point subnet per VM, creates the
//!   host TAP device and installs NAT rules;
//! - [`api`] is the typed Firecracker API client speaking HTTP over the
//!   per-VM Unix socket;
//! - [`manager`] supervises the hypervisor process: spawn, configure, start,
//!   graceful stop, destroy.

pub mod api;
pub mod config;
pub mod manager;
pub mod network;

pub use config::{BootSource, Drive, MachineConfig, NetworkInterface, VmConfig, VsockDevice};
pub use manager::{VmManager, VmManagerConfig, VmState};
pub use network::{NetworkAllocator, NetworkAllocatorConfig, NetworkConfig};
