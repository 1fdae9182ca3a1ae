//! Per-VM network allocation.
//!
//! The host subnet pool (a /16 by default) is partitioned into /30 blocks,
//! one per VM: slot `k` maps to host IP `base + (k<<2) + 1` and guest IP
//! `base + (k<<2) + 2`. Each allocation creates a TAP device on the host,
//! assigns the host address and, when NAT is enabled, installs masquerade
//! and forward rules against the external interface.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{debug, warn};
use zephyr_core::ids::VmId;
use zephyr_core::{Error, Result};

/// Network parameters handed to a booting VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub slot: u32,
    pub tap_device: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: String,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub netmask_bits: u8,
}

impl NetworkConfig {
    /// Kernel boot argument configuring the guest interface, in the
    /// `ip=<client>:<server>:<gw>:<netmask>:<host>:<dev>:off` format.
    pub fn guest_boot_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.252::eth0:off",
            self.guest_ip, self.gateway
        )
    }
}

#[derive(Debug, Clone)]
pub struct NetworkAllocatorConfig {
    /// Base of the /16 pool the /30 blocks are carved from.
    pub base: Ipv4Addr,
    /// Interface NAT egress goes out of, e.g. `eth0`. `None` disables NAT.
    pub external_interface: Option<String>,
    pub dns: Ipv4Addr,
    /// Prefix for host TAP device names.
    pub tap_prefix: String,
}

impl Default for NetworkAllocatorConfig {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(172, 30, 0, 0),
            external_interface: None,
            dns: Ipv4Addr::new(1, 1, 1, 1),
            tap_prefix: "zephtap".to_string(),
        }
    }
}

/// Slot-based allocator over the VM subnet pool.
pub struct NetworkAllocator {
    config: NetworkAllocatorConfig,
    slots: Mutex<SlotMap>,
}

#[derive(Default)]
struct SlotMap {
    owners: HashMap<u32, VmId>,
    next: u32,
}

impl SlotMap {
    fn reserve(&mut self, owner: VmId) -> u32 {
        // Prefer the lowest free slot so released blocks are reused.
        let mut k = 0;
        while self.owners.contains_key(&k) {
            k += 1;
        }
        self.owners.insert(k, owner);
        self.next = self.next.max(k + 1);
        k
    }

    fn release(&mut self, slot: u32) -> bool {
        self.owners.remove(&slot).is_some()
    }
}

impl NetworkAllocator {
    pub fn new(config: NetworkAllocatorConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(SlotMap::default()),
        }
    }

    /// Compute the addresses for a slot without touching the kernel.
    pub fn addresses_for_slot(&self, slot: u32) -> (Ipv4Addr, Ipv4Addr) {
        let base = u32::from(self.config.base);
        let host = Ipv4Addr::from(base + (slot << 2) + 1);
        let guest = Ipv4Addr::from(base + (slot << 2) + 2);
        (host, guest)
    }

    /// Reserve a slot and set up the host side for `vm_id`.
    pub async fn allocate(&self, vm_id: VmId) -> Result<NetworkConfig> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.reserve(vm_id)
        };

        let (host_ip, guest_ip) = self.addresses_for_slot(slot);
        let cfg = NetworkConfig {
            slot,
            tap_device: format!("{}{}", self.config.tap_prefix, slot),
            host_ip,
            guest_ip,
            guest_mac: random_guest_mac(),
            gateway: host_ip,
            dns: self.config.dns,
            netmask_bits: 30,
        };

        if let Err(e) = self.setup_host(&cfg).await {
            // Roll the reservation back so the slot is not leaked.
            self.teardown_host(&cfg).await;
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.release(slot);
            return Err(e);
        }

        debug!(vm_id = %vm_id, slot, tap = %cfg.tap_device, "allocated VM network");
        Ok(cfg)
    }

    /// Tear down NAT rules and the TAP device, then free the slot.
    /// Safe to call twice; missing kernel state is ignored.
    pub async fn release(&self, cfg: &NetworkConfig) -> Result<()> {
        self.teardown_host(cfg).await;

        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.release(cfg.slot);
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .owners
            .len()
    }

    async fn setup_host(&self, cfg: &NetworkConfig) -> Result<()> {
        run_checked(
            "ip",
            &["tuntap", "add", &cfg.tap_device, "mode", "tap"],
        )
        .await?;
        run_checked(
            "ip",
            &[
                "addr",
                "add",
                &format!("{}/{}", cfg.host_ip, cfg.netmask_bits),
                "dev",
                &cfg.tap_device,
            ],
        )
        .await?;
        run_checked("ip", &["link", "set", &cfg.tap_device, "up"]).await?;

        if let Some(ext) = &self.config.external_interface {
            run_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
            run_checked(
                "iptables",
                &[
                    "-t", "nat", "-A", "POSTROUTING",
                    "-s", &format!("{}/{}", cfg.guest_ip, cfg.netmask_bits),
                    "-o", ext,
                    "-j", "MASQUERADE",
                ],
            )
            .await?;
            run_checked(
                "iptables",
                &["-A", "FORWARD", "-i", &cfg.tap_device, "-o", ext, "-j", "ACCEPT"],
            )
            .await?;
            run_checked(
                "iptables",
                &[
                    "-A", "FORWARD", "-i", ext, "-o", &cfg.tap_device,
                    "-m", "state", "--state", "RELATED,ESTABLISHED",
                    "-j", "ACCEPT",
                ],
            )
            .await?;
        }

        Ok(())
    }

    async fn teardown_host(&self, cfg: &NetworkConfig) {
        if let Some(ext) = &self.config.external_interface {
            run_silent(
                "iptables",
                &[
                    "-t", "nat", "-D", "POSTROUTING",
                    "-s", &format!("{}/{}", cfg.guest_ip, cfg.netmask_bits),
                    "-o", ext,
                    "-j", "MASQUERADE",
                ],
            )
            .await;
            run_silent(
                "iptables",
                &["-D", "FORWARD", "-i", &cfg.tap_device, "-o", ext, "-j", "ACCEPT"],
            )
            .await;
            run_silent(
                "iptables",
                &[
                    "-D", "FORWARD", "-i", ext, "-o", &cfg.tap_device,
                    "-m", "state", "--state", "RELATED,ESTABLISHED",
                    "-j", "ACCEPT",
                ],
            )
            .await;
        }

        run_silent("ip", &["link", "del", &cfg.tap_device]).await;
    }
}

/// A random unicast MAC with the locally-administered bit set.
fn random_guest_mac() -> String {
    let entropy = *uuid::Uuid::new_v4().as_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&entropy[..6]);
    mac[0] = (mac[0] | 0x02) & 0xFE;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

async fn run_checked(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::NetworkSetupFailed(format!("{program} spawn failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::NetworkSetupFailed(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

async fn run_silent(program: &str, args: &[&str]) {
    match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            debug!(
                program,
                args = %args.join(" "),
                "teardown command reported missing state"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(program, error = %e, "teardown command could not run"),
    }
}
