//! A Network Backend that records what it would do instead of doing it.
//!
//! Used by `--dry-run` and by the state machine tests. Each call is logged and
//! appended to an operation list as `name:detail`. Tests can make a step fail
//! or stall by name.

use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, ShareError};
use crate::sharing::SharingConfig;
use crate::system::NetworkBackend;

#[derive(Default)]
pub struct DryRunBackend {
    operations: Mutex<Vec<String>>,
    fail_operation: Mutex<Option<String>>,
    stall: Mutex<Option<(String, Duration)>>,
    dns_servers: Vec<IpAddr>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn endpoints(source: &str, target: &str) -> String {
    format!("{}->{}", source, target)
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolvers reported by `discover_upstream_dns`.
    pub fn with_dns(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    async fn step(&self, operation: String) -> Result<()> {
        info!(operation = %operation, "dry run");
        let name = operation
            .split(':')
            .next()
            .unwrap_or(operation.as_str())
            .to_string();
        lock(&self.operations).push(operation.clone());

        let delay = lock(&self.stall)
            .as_ref()
            .filter(|(op, _)| *op == name)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if lock(&self.fail_operation).as_deref() == Some(name.as_str()) {
            return Err(ShareError::CommandFailed {
                command: operation,
                message: "failure injected by dry run".into(),
            });
        }
        Ok(())
    }
}

/// Fault injection and inspection for tests.
#[cfg(test)]
impl DryRunBackend {
    /// Make the named step fail from now on (`None` to stop failing).
    pub fn fail_on(&self, operation: Option<&str>) {
        *lock(&self.fail_operation) = operation.map(str::to_string);
    }

    /// Make the named step take `delay` before completing.
    pub fn stall_on(&self, operation: &str, delay: Duration) {
        *lock(&self.stall) = Some((operation.to_string(), delay));
    }

    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    /// How many recorded operations equal `operation` exactly.
    pub fn count(&self, operation: &str) -> usize {
        lock(&self.operations)
            .iter()
            .filter(|op| op.as_str() == operation)
            .count()
    }
}

#[async_trait]
impl NetworkBackend for DryRunBackend {
    async fn teardown_sharing(&self, cfg: &SharingConfig) -> Result<()> {
        let detail = match cfg.rule_endpoints() {
            Some((source, target)) => endpoints(source, target),
            None => "-".to_string(),
        };
        self.step(format!("teardown_sharing:{}", detail)).await
    }

    async fn bring_up(&self, interface: &str) -> Result<()> {
        self.step(format!("bring_up:{}", interface)).await
    }

    async fn apply_nat(&self, source: &str, target: &str) -> Result<()> {
        self.step(format!("apply_nat:{}", endpoints(source, target)))
            .await
    }

    async fn apply_access_point_dns(&self, target: &str, _dns_servers: &[IpAddr]) -> Result<()> {
        self.step(format!("apply_access_point_dns:{}", target)).await
    }

    async fn restart_access_point_daemons(&self) -> Result<()> {
        self.step("restart_access_point_daemons".to_string()).await
    }

    async fn discover_upstream_dns(&self, source: &str) -> Vec<IpAddr> {
        match self.step(format!("discover_upstream_dns:{}", source)).await {
            Ok(()) => self.dns_servers.clone(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_fails_by_name() {
        let backend = DryRunBackend::new();
        backend.apply_nat("eth0", "wlan0").await.unwrap();
        backend.fail_on(Some("apply_nat"));
        assert!(backend.apply_nat("eth0", "wlan0").await.is_err());
        backend.fail_on(None);
        backend.teardown_sharing(&SharingConfig::inactive()).await.unwrap();

        assert_eq!(
            backend.operations(),
            vec![
                "apply_nat:eth0->wlan0",
                "apply_nat:eth0->wlan0",
                "teardown_sharing:-",
            ]
        );
        assert_eq!(backend.count("apply_nat:eth0->wlan0"), 2);
    }

    #[tokio::test]
    async fn test_failed_discovery_is_empty() {
        let backend = DryRunBackend::new().with_dns(vec!["10.0.0.1".parse().unwrap()]);
        assert_eq!(backend.discover_upstream_dns("usb0").await.len(), 1);
        backend.fail_on(Some("discover_upstream_dns"));
        assert!(backend.discover_upstream_dns("usb0").await.is_empty());
    }
}
