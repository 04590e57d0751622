//! Static gateway address on the access point interface.
//!
//! Clients are told to use the gateway as router and DNS server, so it must
//! be assigned before dnsmasq binds to it. The address is also written to
//! dhcpcd.conf so it comes back after a reboot.

use std::net::Ipv4Addr;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info};

use crate::error::Result;
use crate::system::command;

const MARKER: &str = "# apshare: static address for the access point";

pub fn prefix_len(netmask: Ipv4Addr) -> u32 {
    u32::from(netmask).count_ones()
}

/// Every IPv4 CIDR in `ip -o -4 addr show dev <iface>` output.
fn assigned_cidrs(output: &str) -> Vec<&str> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            parts.find(|p| *p == "inet")?;
            parts.next()
        })
        .collect()
}

/// Make `gateway/prefix` the only IPv4 address on `interface`.
pub async fn ensure_gateway_address(interface: &str, gateway: Ipv4Addr, prefix: u32) -> Result<()> {
    let wanted = format!("{}/{}", gateway, prefix);
    let output = command::run("ip", &["-o", "-4", "addr", "show", "dev", interface]).await?;
    let cidrs = assigned_cidrs(&output);
    if cidrs == [wanted.as_str()] {
        debug!(interface, address = %wanted, "Gateway address already set");
        return Ok(());
    }

    info!(interface, address = %wanted, current = ?cidrs, "Setting access point gateway address");
    command::run("ip", &["addr", "flush", "dev", interface]).await?;
    command::run("ip", &["addr", "add", &wanted, "dev", interface]).await?;
    Ok(())
}

/// `existing` with any block for `interface` replaced by a static one.
pub fn render_dhcpcd_conf(existing: &str, interface: &str, gateway: Ipv4Addr, prefix: u32) -> String {
    let header = format!("interface {}", interface);
    let mut lines: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in existing.lines() {
        let trimmed = line.trim();
        if trimmed == header {
            in_block = true;
            if lines.last() == Some(&MARKER) {
                lines.pop();
            }
            continue;
        }
        if in_block && trimmed.starts_with("interface ") {
            in_block = false;
        }
        if !in_block {
            lines.push(line);
        }
    }

    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(MARKER);
    out.push('\n');
    out.push_str(&header);
    out.push('\n');
    out.push_str(&format!("    static ip_address={}/{}\n", gateway, prefix));
    out.push_str("    nohook wpa_supplicant\n");
    out
}

/// Record the static address in dhcpcd.conf. Hosts without dhcpcd are left alone.
pub async fn persist_gateway_address(
    dhcpcd_conf: &Path,
    interface: &str,
    gateway: Ipv4Addr,
    prefix: u32,
) -> Result<()> {
    let existing = match fs::read_to_string(dhcpcd_conf).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %dhcpcd_conf.display(), "No dhcpcd config, address not persisted");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let rendered = render_dhcpcd_conf(&existing, interface, gateway, prefix);
    if rendered != existing {
        fs::write(dhcpcd_conf, rendered).await?;
        info!(interface, "dhcpcd config updated with static access point address");
    }
    Ok(())
}
