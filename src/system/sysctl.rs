//! IPv4 forwarding control via sysctl.

use std::path::Path;

use tokio::fs;

use crate::error::{Result, ShareError};
use crate::system::command;

const FORWARDING_KEY: &str = "net.ipv4.ip_forward";
const PERSIST_LINE: &str = "net.ipv4.ip_forward=1";

/// Kernel IPv4 forwarding switch.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpForwarding;

impl IpForwarding {
    pub fn new() -> Self {
        Self
    }

    /// Get the current IP forwarding state.
    pub async fn get_state(&self) -> Result<bool> {
        let stdout = command::run("sysctl", &["-n", FORWARDING_KEY]).await?;
        parse_state(&stdout)
    }

    pub async fn enable(&self) -> Result<()> {
        self.set_state(true).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.set_state(false).await
    }

    async fn set_state(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        command::run("sysctl", &["-w", &format!("{}={}", FORWARDING_KEY, value)]).await?;
        Ok(())
    }

    /// Make forwarding survive a reboot by adding it to sysctl.conf if missing.
    pub async fn persist(&self, sysctl_conf: &Path) -> Result<()> {
        let contents = match fs::read_to_string(sysctl_conf).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if let Some(updated) = with_forwarding_persisted(&contents) {
            fs::write(sysctl_conf, updated).await?;
        }
        Ok(())
    }
}

fn parse_state(stdout: &str) -> Result<bool> {
    match stdout.trim() {
        "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ShareError::ParseError(format!(
            "Unexpected sysctl value: {}",
            other
        ))),
    }
}

/// `contents` with the forwarding line appended, or `None` if already enabled.
fn with_forwarding_persisted(contents: &str) -> Option<String> {
    let already = contents
        .lines()
        .map(|l| l.split_whitespace().collect::<String>())
        .any(|l| l == PERSIST_LINE);
    if already {
        return None;
    }

    let mut updated = contents.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str("\n# Enable IP forwarding for connection sharing\n");
    updated.push_str(PERSIST_LINE);
    updated.push('\n');
    Some(updated)
}
