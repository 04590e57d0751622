//! Subprocess helpers shared by the system modules.

use std::process::Output;

use tokio::process::Command;

use crate::error::{Result, ShareError};

fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Run a command and hand back its raw output, whatever the exit status.
/// Fails only if the program could not be spawned.
pub async fn output(program: &str, args: &[&str]) -> Result<Output> {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ShareError::CommandFailed {
            command: render(program, args),
            message: e.to_string(),
        })
}

/// Run a command that must succeed, returning its stdout.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = output(program, args).await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
            return Err(ShareError::PermissionDenied);
        }
        return Err(ShareError::CommandFailed {
            command: render(program, args),
            message: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
