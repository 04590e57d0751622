//! Sharing configuration records and the status view built from them.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One sharing relationship: which uplink is shared onto which interface.
///
/// Stored as-is in both the current and the pending slot. `previous` is only
/// meaningful on a pending entry and is kept one level deep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharingConfig {
    pub active: bool,
    /// Interface providing internet access.
    #[serde(default)]
    pub source: Option<String>,
    /// Interface receiving shared access.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub nat_enabled: bool,
    /// Upstream resolvers discovered at enable time.
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    /// Configuration to restore if this one is never confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<SharingConfig>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Wall-clock end of the confirmation window. Persisted so a restart
    /// can tell a pending entry outlived its timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_deadline: Option<DateTime<Utc>>,
}

impl SharingConfig {
    /// The deactivated configuration, also what an empty store reads as.
    pub fn inactive() -> Self {
        Self {
            active: false,
            source: None,
            target: None,
            nat_enabled: false,
            dns_servers: Vec::new(),
            previous: None,
            created_at: Utc::now(),
            confirm_deadline: None,
        }
    }

    pub fn new_active(
        source: &str,
        target: &str,
        nat_enabled: bool,
        dns_servers: Vec<IpAddr>,
        previous: SharingConfig,
    ) -> Self {
        Self {
            active: true,
            source: Some(source.to_string()),
            target: Some(target.to_string()),
            nat_enabled,
            dns_servers,
            previous: Some(Box::new(previous)),
            created_at: Utc::now(),
            confirm_deadline: None,
        }
    }

    /// Record of an apply in progress: inactive, but naming the interfaces
    /// whose rules may already be on the host.
    pub fn attempt(source: &str, target: &str, nat_enabled: bool) -> Self {
        Self {
            source: Some(source.to_string()),
            target: Some(target.to_string()),
            nat_enabled,
            ..Self::inactive()
        }
    }

    /// Copy suitable for use as someone else's `previous`: no history of its own.
    /// An inactive record snapshots as plain inactive, attempt or not.
    pub fn snapshot(&self) -> Self {
        if !self.active {
            return Self::inactive();
        }
        Self {
            previous: None,
            confirm_deadline: None,
            ..self.clone()
        }
    }

    /// Source and target, if this configuration is active and names both.
    pub fn endpoints(&self) -> Option<(&str, &str)> {
        if !self.active {
            return None;
        }
        self.rule_endpoints()
    }

    /// Source and target whose rules a teardown must remove. Unlike
    /// `endpoints`, also set for an attempt that failed part way.
    pub fn rule_endpoints(&self) -> Option<(&str, &str)> {
        match (self.source.as_deref(), self.target.as_deref()) {
            (Some(source), Some(target)) => Some((source, target)),
            _ => None,
        }
    }
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self::inactive()
    }
}

/// Where the state machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingState {
    Disabled,
    Active,
    /// A provisional configuration is applied and the revert timer is running.
    PendingConfirmation,
}

/// Result of a status query.
#[derive(Debug, Clone, Serialize)]
pub struct SharingStatus {
    /// The pending configuration while one exists, otherwise the current one.
    #[serde(flatten)]
    pub config: SharingConfig,
    pub pending_confirmation: bool,
    /// Whole seconds until automatic revert, rounded up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<u64>,
}

impl SharingStatus {
    pub fn new(config: SharingConfig, pending: bool, remaining: Option<Duration>) -> Self {
        Self {
            config,
            pending_confirmation: pending,
            remaining_seconds: remaining.map(ceil_secs),
        }
    }

    pub fn state(&self) -> SharingState {
        if self.pending_confirmation {
            SharingState::PendingConfirmation
        } else if self.config.active {
            SharingState::Active
        } else {
            SharingState::Disabled
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}

/// Outcome of a confirm request. Losing the race to the revert timer is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    Confirmed(SharingConfig),
    NothingPending,
}
