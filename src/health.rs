//! Connection health verification.
//!
//! Checks that an active sharing configuration is still really in place:
//! uplink up, NAT rule loaded, IP forwarding on. Something outside this daemon
//! (a reboot without persistence, another firewall tool) can undo any of them.

use serde::Serialize;

use crate::sharing::SharingConfig;
use crate::system::firewall::{nat_rules, Firewall};
use crate::system::network::parse_links;
use crate::system::sysctl::IpForwarding;
use crate::system::command;

/// Overall health of the active sharing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything is working normally.
    #[default]
    Healthy,
    /// Something is degraded but traffic may still flow.
    Degraded(String),
    /// Uplink is gone. Traffic is not flowing.
    Down(String),
}

/// Run health checks against an active configuration.
///
/// Checks (in order of severity):
/// 1. Uplink interface is still UP
/// 2. The MASQUERADE rule is still loaded (when NAT is enabled)
/// 3. IP forwarding is still enabled
pub async fn check_health(cfg: &SharingConfig) -> HealthStatus {
    let Some((source, target)) = cfg.endpoints() else {
        return HealthStatus::Healthy;
    };

    if !is_interface_up(source).await {
        return HealthStatus::Down(format!("Uplink {} is no longer up", source));
    }

    if cfg.nat_enabled {
        let masquerade = &nat_rules(source, target)[0];
        // Can't run iptables: assume OK rather than false-alarming
        if let Ok(false) = Firewall::new().rule_exists(masquerade).await {
            return HealthStatus::Degraded(format!("NAT rule for {} was removed externally", source));
        }
    }

    if let Ok(false) = IpForwarding::new().get_state().await {
        return HealthStatus::Degraded("IP forwarding was disabled externally".to_string());
    }

    HealthStatus::Healthy
}

async fn is_interface_up(interface: &str) -> bool {
    let Ok(output) = command::output("ip", &["-o", "link", "show", "dev", interface]).await else {
        // Can't run ip: assume OK
        return true;
    };

    if !output.status.success() {
        // Interface doesn't exist anymore
        return false;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_links(&stdout).iter().any(|(_, up)| *up)
}
