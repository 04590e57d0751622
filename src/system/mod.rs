//! System interaction: the Network Backend that applies sharing to the OS, and
//! the Interface Inventory that describes the interfaces available.

pub mod address;
pub mod backend;
pub mod command;
pub mod dhcp;
pub mod dns;
pub mod dry_run;
pub mod firewall;
pub mod network;
pub mod resolved;
pub mod service;
pub mod sysctl;

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::health::HealthStatus;
use crate::sharing::SharingConfig;

pub use backend::LinuxBackend;
pub use dry_run::DryRunBackend;
pub use network::{InterfaceInfo, LinuxInventory};

/// Applies and removes sharing on the host.
///
/// Steps are not atomic across OS resources; each reports its own failure.
/// Teardown must succeed when nothing is applied.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Remove everything `cfg` applied. Idempotent.
    async fn teardown_sharing(&self, cfg: &SharingConfig) -> Result<()>;

    /// Bring an interface administratively up.
    async fn bring_up(&self, interface: &str) -> Result<()>;

    /// Enable forwarding and NAT from `target` out through `source`.
    async fn apply_nat(&self, source: &str, target: &str) -> Result<()>;

    /// Point the access point's DHCP/DNS forwarder at `dns_servers`.
    async fn apply_access_point_dns(&self, target: &str, dns_servers: &[IpAddr]) -> Result<()>;

    async fn restart_access_point_daemons(&self) -> Result<()>;

    /// Best-effort; empty on failure.
    async fn discover_upstream_dns(&self, source: &str) -> Vec<IpAddr>;

    async fn check_health(&self, _cfg: &SharingConfig) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Enumerates interfaces and classifies them.
#[async_trait]
pub trait InterfaceInventory: Send + Sync {
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    /// Whether `name` serves the administrator's own access point. Changes
    /// targeting it need confirmation.
    fn is_access_point_interface(&self, name: &str) -> bool;

    async fn is_usb_interface(&self, name: &str) -> bool;
}
