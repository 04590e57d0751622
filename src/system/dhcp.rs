//! dnsmasq configuration for the access point network.
//!
//! dnsmasq serves DHCP on the AP interface and forwards client DNS queries to
//! the resolvers discovered on the uplink. Only the directives listed in
//! `MANAGED_PREFIXES` are owned here; everything else in the file is kept.

use std::net::IpAddr;
use std::path::Path;

use tokio::fs;
use tracing::{info, warn};

use crate::config::AccessPointSettings;
use crate::error::Result;
use crate::system::service;

const MARKER: &str = "# apshare: access point DNS forwarding";

/// Directives rewritten on every apply.
const MANAGED_PREFIXES: &[&str] = &[
    "server=",
    "interface=",
    "dhcp-range=",
    "dhcp-option=",
    "no-resolv",
    "dhcp-leasefile=",
    "bind-interfaces",
    "listen-address=",
    "cache-size=",
    "dhcp-authoritative",
    MARKER,
];

const LEASE_FILE: &str = "/var/lib/misc/dnsmasq.leases";

/// Rewrite `existing` so dnsmasq serves `target` and forwards to `dns_servers`.
pub fn render_dnsmasq_conf(
    existing: &str,
    target: &str,
    dns_servers: &[IpAddr],
    ap: &AccessPointSettings,
) -> String {
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !MANAGED_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        })
        .map(str::to_string)
        .collect();

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    for flag in ["domain-needed", "bogus-priv"] {
        if !lines.iter().any(|l| l.trim() == flag) {
            lines.push(flag.to_string());
        }
    }

    if !lines.is_empty() {
        lines.push(String::new());
    }
    lines.push(MARKER.to_string());
    lines.push(format!("interface={}", target));
    lines.push("bind-interfaces".to_string());
    lines.push(format!("listen-address=127.0.0.1,{}", ap.gateway));
    lines.push("no-resolv".to_string());
    for server in dns_servers {
        lines.push(format!("server={}", server));
    }
    lines.push(format!(
        "dhcp-range={},{},{},{}",
        ap.dhcp_range_start, ap.dhcp_range_end, ap.netmask, ap.lease_time
    ));
    // 3 = router, 6 = DNS server: both point clients at this host.
    lines.push(format!("dhcp-option=3,{}", ap.gateway));
    lines.push(format!("dhcp-option=6,{}", ap.gateway));
    lines.push("dhcp-authoritative".to_string());
    lines.push(format!("dhcp-leasefile={}", LEASE_FILE));
    lines.push("cache-size=1000".to_string());

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Rewrite the dnsmasq config file (keeping a `.bak` copy) and restart dnsmasq.
pub async fn configure_dnsmasq(
    conf_path: &Path,
    target: &str,
    dns_servers: &[IpAddr],
    ap: &AccessPointSettings,
) -> Result<()> {
    let existing = match fs::read_to_string(conf_path).await {
        Ok(contents) => {
            let backup = conf_path.with_extension("conf.bak");
            fs::write(&backup, &contents).await?;
            contents
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %conf_path.display(), "dnsmasq config not found, writing a fresh one");
            String::new()
        }
        Err(e) => return Err(e.into()),
    };

    let rendered = render_dnsmasq_conf(&existing, target, dns_servers, ap);
    fs::write(conf_path, rendered).await?;
    info!(
        target,
        servers = ?dns_servers,
        "dnsmasq now forwards access point DNS"
    );

    if let Err(e) = service::restart("dnsmasq").await {
        warn!("Restarting dnsmasq failed ({}), trying to start it", e);
        service::start("dnsmasq").await?;
    }
    Ok(())
}
