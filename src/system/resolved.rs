//! Keeping systemd-resolved out of dnsmasq's way.
//!
//! resolved's stub listener holds port 53 on many distributions, which stops
//! dnsmasq from serving the access point. The stub is switched off only when
//! it is actually the one holding the port.

use std::path::Path;

use tokio::fs;
use tracing::{debug, info};

use crate::error::Result;
use crate::system::{command, service};

const STUB_LISTENER_OFF: &str = "DNSStubListener=no";

/// `contents` with the stub listener disabled, or `None` if it already is.
pub fn with_stub_listener_disabled(contents: &str) -> Option<String> {
    let mut found = false;
    let mut lines: Vec<&str> = Vec::new();

    for line in contents.lines() {
        if line.trim_start().starts_with("DNSStubListener=") {
            if line.trim() == STUB_LISTENER_OFF {
                return None;
            }
            if !found {
                lines.push(STUB_LISTENER_OFF);
                found = true;
            }
            continue;
        }
        lines.push(line);
    }

    if !found {
        if !lines.iter().any(|l| l.trim() == "[Resolve]") {
            lines.push("[Resolve]");
        }
        lines.push(STUB_LISTENER_OFF);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Some(out)
}

/// Whether `ss -lntup` output shows systemd-resolved bound to port 53.
fn resolved_holds_port(ss_output: &str) -> bool {
    ss_output
        .lines()
        .any(|l| l.contains(":53 ") && l.contains("systemd-resolve"))
}

/// Disable resolved's stub listener (keeping a `.bak` copy) if it owns port 53.
pub async fn release_dns_port(resolved_conf: &Path) -> Result<()> {
    let status = command::output("systemctl", &["is-active", "systemd-resolved"]).await?;
    if String::from_utf8_lossy(&status.stdout).trim() != "active" {
        debug!("systemd-resolved not running");
        return Ok(());
    }

    let sockets = command::run("ss", &["-H", "-lntup", "sport = :53"]).await?;
    if !resolved_holds_port(&sockets) {
        debug!("Port 53 is free for dnsmasq");
        return Ok(());
    }

    let contents = match fs::read_to_string(resolved_conf).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let Some(updated) = with_stub_listener_disabled(&contents) else {
        return Ok(());
    };

    if !contents.is_empty() {
        fs::write(resolved_conf.with_extension("conf.bak"), &contents).await?;
    }
    fs::write(resolved_conf, updated).await?;
    info!("systemd-resolved holds port 53, disabling its stub listener");
    service::restart("systemd-resolved").await
}

/// Drop cached answers so clients see the new upstream right away. Every
/// cache is optional, so failures are only logged.
pub async fn flush_dns_caches() {
    let attempts: [(&str, &[&str]); 3] = [
        ("resolvectl", &["flush-caches"]),
        ("systemctl", &["try-restart", "nscd"]),
        ("pkill", &["-HUP", "dnsmasq"]),
    ];
    for (program, args) in attempts {
        if let Err(e) = command::run(program, args).await {
            debug!("DNS cache flush skipped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_listener_line_replaced() {
        let contents = "[Resolve]\n#DNS=\nDNSStubListener=yes\n";
        assert_eq!(
            with_stub_listener_disabled(contents).unwrap(),
            "[Resolve]\n#DNS=\nDNSStubListener=no\n"
        );
    }

    #[test]
    fn test_stub_listener_added_once() {
        let updated = with_stub_listener_disabled("[Resolve]\n#DNS=\n").unwrap();
        assert!(updated.ends_with("#DNS=\nDNSStubListener=no\n"));
        assert_eq!(with_stub_listener_disabled(&updated), None);

        let fresh = with_stub_listener_disabled("").unwrap();
        assert_eq!(fresh, "[Resolve]\nDNSStubListener=no\n");
    }

    #[test]
    fn test_resolved_holds_port() {
        let ss = "\
udp UNCONN 0 0 127.0.0.53%lo:53 0.0.0.0:* users:((\"systemd-resolve\",pid=412,fd=13))
tcp LISTEN 0 4096 127.0.0.53%lo:53 0.0.0.0:* users:((\"systemd-resolve\",pid=412,fd=14))
";
        assert!(resolved_holds_port(ss));
        assert!(!resolved_holds_port(
            "udp UNCONN 0 0 0.0.0.0:53 0.0.0.0:* users:((\"dnsmasq\",pid=9,fd=4))\n"
        ));
        assert!(!resolved_holds_port(""));
    }
}
