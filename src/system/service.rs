//! systemd unit control.

use tracing::info;

use crate::error::{Result, ShareError};
use crate::system::command;

pub async fn restart(unit: &str) -> Result<()> {
    info!(unit, "Restarting service");
    command::run("systemctl", &["restart", unit]).await?;
    Ok(())
}

pub async fn start(unit: &str) -> Result<()> {
    command::run("systemctl", &["start", unit]).await?;
    Ok(())
}

/// Restart every unit in order, attempting all of them even if one fails.
pub async fn restart_all(units: &[String]) -> Result<()> {
    let mut errors = Vec::new();

    for unit in units {
        if let Err(e) = restart(unit).await {
            errors.push(format!("{}: {}", unit, e));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ShareError::CommandFailed {
            command: "systemctl restart".into(),
            message: errors.join("; "),
        })
    }
}
