//! Upstream DNS discovery for the uplink interface.
//!
//! Tries systemd-resolved first, then `/etc/resolv.conf`, then NetworkManager.
//! Every source is best-effort: a missing tool just means an empty answer.

use std::net::IpAddr;

use tokio::fs;
use tracing::debug;

use crate::system::command;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Discover resolvers reachable through `source`, in preference order.
///
/// Returns an empty list when nothing usable is found; the caller decides
/// the fallback.
pub async fn discover_upstream_dns(source: &str) -> Vec<IpAddr> {
    if let Ok(out) = command::run("resolvectl", &["status", source]).await {
        let servers = parse_resolvectl(&out);
        if !servers.is_empty() {
            debug!(source, ?servers, "DNS servers from systemd-resolved");
            return servers;
        }
    }

    if let Ok(contents) = fs::read_to_string(RESOLV_CONF).await {
        let servers = parse_resolv_conf(&contents);
        if !servers.is_empty() {
            debug!(source, ?servers, "DNS servers from resolv.conf");
            return servers;
        }
    }

    if let Ok(out) = command::run("nmcli", &["-t", "-f", "IP4.DNS", "device", "show", source]).await
    {
        let servers = parse_nmcli(&out);
        if !servers.is_empty() {
            debug!(source, ?servers, "DNS servers from nmcli");
            return servers;
        }
    }

    Vec::new()
}

fn push_unique(servers: &mut Vec<IpAddr>, addr: IpAddr) {
    if !servers.contains(&addr) {
        servers.push(addr);
    }
}

/// Parse `resolvectl status <link>` output.
///
/// Extra servers are printed on continuation lines with no label:
///
/// ```text
///     DNS Servers: 10.0.0.1
///                  10.0.0.2
///      DNS Domain: lan
/// ```
fn parse_resolvectl(output: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    let mut in_server_list = false;

    for line in output.lines() {
        let trimmed = line.trim();

        let values = if let Some(rest) = trimmed.strip_prefix("Current DNS Server:") {
            in_server_list = false;
            rest
        } else if let Some(rest) = trimmed.strip_prefix("DNS Servers:") {
            in_server_list = true;
            rest
        } else if in_server_list && trimmed.split_whitespace().all(|w| server_addr(w).is_some()) {
            trimmed
        } else {
            in_server_list = false;
            continue;
        };

        for ip in values.split_whitespace().filter_map(server_addr) {
            push_unique(&mut servers, ip);
        }
    }

    servers
}

/// resolvectl may append `#server-name` to DNS-over-TLS entries.
fn server_addr(word: &str) -> Option<IpAddr> {
    word.split('#').next().and_then(|addr| addr.parse().ok())
}

/// Parse `nameserver` lines, skipping loopback stubs (the forwarder would query itself).
fn parse_resolv_conf(contents: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("nameserver") {
            continue;
        }
        if let Some(Ok(ip)) = parts.next().map(str::parse::<IpAddr>) {
            if !ip.is_loopback() {
                push_unique(&mut servers, ip);
            }
        }
    }
    servers
}

/// Parse `nmcli -t -f IP4.DNS device show` output (`IP4.DNS[1]:8.8.8.8`).
fn parse_nmcli(output: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.starts_with("IP4.DNS") {
            if let Ok(ip) = value.trim().parse() {
                push_unique(&mut servers, ip);
            }
        }
    }
    servers
}
