//! The Linux Network Backend: iptables, sysctl, dnsmasq and systemd.
//!
//! Steps that only make the setup survive a reboot (sysctl.conf, dhcpcd.conf,
//! the saved rule set) log a warning on failure instead of failing the step.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{AccessPointSettings, Config};
use crate::error::{Result, ShareError};
use crate::health::{self, HealthStatus};
use crate::sharing::SharingConfig;
use crate::system::firewall::{self, access_point_dns_rules, nat_rules, Firewall};
use crate::system::sysctl::IpForwarding;
use crate::system::{address, command, dhcp, dns, resolved, service, NetworkBackend};

const SYSCTL_CONF: &str = "/etc/sysctl.conf";
const DHCPCD_CONF: &str = "/etc/dhcpcd.conf";
const RESOLVED_CONF: &str = "/etc/systemd/resolved.conf";
const IPTABLES_RULES: &str = "/etc/iptables.ipv4.nat";
const IPTABLES_HOOK: &str = "/etc/network/if-pre-up.d/iptables";

pub struct LinuxBackend {
    firewall: Firewall,
    ip_forwarding: IpForwarding,
    access_point_interface: String,
    access_point: AccessPointSettings,
    dnsmasq_conf: PathBuf,
    sysctl_conf: PathBuf,
    dhcpcd_conf: PathBuf,
    resolved_conf: PathBuf,
    iptables_rules: PathBuf,
    iptables_hook: PathBuf,
    services: Vec<String>,
}

impl LinuxBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            firewall: Firewall::new(),
            ip_forwarding: IpForwarding::new(),
            access_point_interface: config.access_point_interface.clone(),
            access_point: config.access_point.clone(),
            dnsmasq_conf: config.dnsmasq_conf.clone(),
            sysctl_conf: PathBuf::from(SYSCTL_CONF),
            dhcpcd_conf: PathBuf::from(DHCPCD_CONF),
            resolved_conf: PathBuf::from(RESOLVED_CONF),
            iptables_rules: PathBuf::from(IPTABLES_RULES),
            iptables_hook: PathBuf::from(IPTABLES_HOOK),
            services: config.access_point_services.clone(),
        }
    }

    async fn save_rules(&self) {
        if let Err(e) = firewall::save_rules(&self.iptables_rules, &self.iptables_hook).await {
            warn!("Could not save iptables rules: {}", e);
        }
    }
}

#[async_trait]
impl NetworkBackend for LinuxBackend {
    async fn teardown_sharing(&self, cfg: &SharingConfig) -> Result<()> {
        let mut errors = Vec::new();

        if let Some((source, target)) = cfg.rule_endpoints() {
            debug!(source, target, "Removing sharing rules");
            if let Err(e) = self.firewall.remove_all(&nat_rules(source, target)).await {
                errors.push(format!("NAT rules: {}", e));
            }
            if target == self.access_point_interface {
                if let Err(e) = self.firewall.remove_all(&access_point_dns_rules(target)).await {
                    errors.push(format!("access point DNS rules: {}", e));
                }
            }
        }

        if let Err(e) = self.ip_forwarding.disable().await {
            errors.push(format!("IP forwarding: {}", e));
        }
        self.save_rules().await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShareError::CommandFailed {
                command: "teardown".into(),
                message: errors.join("; "),
            })
        }
    }

    async fn bring_up(&self, interface: &str) -> Result<()> {
        command::run("ip", &["link", "set", interface, "up"]).await?;
        Ok(())
    }

    async fn apply_nat(&self, source: &str, target: &str) -> Result<()> {
        self.ip_forwarding.enable().await?;
        if let Err(e) = self.ip_forwarding.persist(&self.sysctl_conf).await {
            warn!("Could not persist IP forwarding: {}", e);
        }
        self.firewall.apply_all(&nat_rules(source, target)).await?;
        self.save_rules().await;
        info!(source, target, "NAT rules applied");
        Ok(())
    }

    async fn apply_access_point_dns(&self, target: &str, dns_servers: &[IpAddr]) -> Result<()> {
        let gateway = self.access_point.gateway;
        let prefix = address::prefix_len(self.access_point.netmask);
        address::ensure_gateway_address(target, gateway, prefix).await?;
        if let Err(e) =
            address::persist_gateway_address(&self.dhcpcd_conf, target, gateway, prefix).await
        {
            warn!("Could not persist access point address: {}", e);
        }

        if let Err(e) = resolved::release_dns_port(&self.resolved_conf).await {
            warn!("Could not free port 53 from systemd-resolved: {}", e);
        }

        self.firewall
            .apply_all(&access_point_dns_rules(target))
            .await?;
        dhcp::configure_dnsmasq(&self.dnsmasq_conf, target, dns_servers, &self.access_point)
            .await?;
        resolved::flush_dns_caches().await;
        Ok(())
    }

    async fn restart_access_point_daemons(&self) -> Result<()> {
        service::restart_all(&self.services).await
    }

    async fn discover_upstream_dns(&self, source: &str) -> Vec<IpAddr> {
        dns::discover_upstream_dns(source).await
    }

    async fn check_health(&self, cfg: &SharingConfig) -> HealthStatus {
        health::check_health(cfg).await
    }
}
