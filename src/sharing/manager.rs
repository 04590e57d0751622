//! The connection sharing state machine.
//!
//! A change aimed at the access point interface is provisional: it is written
//! to the pending slot and a revert timer is armed. `confirm` promotes it, the
//! timer reverts it, `disable` discards it. Every mutating operation, the
//! timer callback included, runs under one async mutex so they never
//! interleave. Status reads go through a watch channel holding a copy of both
//! slots, published after each mutation, so they never wait on a slow backend.

use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, ShareError};
use crate::health::HealthStatus;
use crate::sharing::model::{ConfirmOutcome, SharingConfig, SharingStatus};
use crate::sharing::store::ConfigStore;
use crate::sharing::timer::RevertTimer;
use crate::system::{InterfaceInfo, InterfaceInventory, NetworkBackend};

/// Tunables for a manager instance.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub confirmation_window: Duration,
    pub backend_timeout: Duration,
    pub fallback_dns: Vec<IpAddr>,
}

impl ManagerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            confirmation_window: config.confirmation_window(),
            backend_timeout: config.backend_timeout(),
            fallback_dns: config.fallback_dns.clone(),
        }
    }
}

/// What status readers see.
#[derive(Debug, Clone)]
struct Snapshot {
    current: SharingConfig,
    pending: Option<SharingConfig>,
    revert_at: Option<Instant>,
}

/// State touched only under the lock.
struct Locked {
    store: Box<dyn ConfigStore>,
    timer: RevertTimer,
}

struct Inner {
    backend: Arc<dyn NetworkBackend>,
    inventory: Arc<dyn InterfaceInventory>,
    options: ManagerOptions,
    locked: Mutex<Locked>,
    snapshot: watch::Sender<Snapshot>,
}

/// Handle to the sharing state machine. Cheap to clone.
#[derive(Clone)]
pub struct SharingManager {
    inner: Arc<Inner>,
}

impl SharingManager {
    pub fn new(
        store: Box<dyn ConfigStore>,
        backend: Arc<dyn NetworkBackend>,
        inventory: Arc<dyn InterfaceInventory>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let snapshot = Snapshot {
            current: store.read_current()?,
            pending: store.read_pending()?,
            revert_at: None,
        };
        let (snapshot, _) = watch::channel(snapshot);

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                inventory,
                options,
                locked: Mutex::new(Locked {
                    store,
                    timer: RevertTimer::new(),
                }),
                snapshot,
            }),
        })
    }

    /// Whether a change targeting `target` must be confirmed.
    pub fn requires_confirmation(&self, target: &str) -> bool {
        self.inner.inventory.is_access_point_interface(target)
    }

    /// Current state. Never blocks on a running operation.
    pub fn status(&self) -> SharingStatus {
        let snap = self.inner.snapshot.borrow().clone();
        match snap.pending {
            Some(pending) => {
                let remaining = match snap.revert_at {
                    Some(at) => Some(at.saturating_duration_since(Instant::now())),
                    None => pending
                        .confirm_deadline
                        .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO)),
                };
                SharingStatus::new(pending, true, remaining)
            }
            None => SharingStatus::new(snap.current, false, None),
        }
    }

    /// Ask the backend whether the active configuration is still in place.
    pub async fn check_health(&self) -> Option<HealthStatus> {
        let status = self.status();
        if !status.config.active {
            return None;
        }
        let check = self.inner.backend.check_health(&status.config);
        match tokio::time::timeout(self.inner.options.backend_timeout, check).await {
            Ok(health) => Some(health),
            Err(_) => Some(HealthStatus::Degraded("health check timed out".into())),
        }
    }

    pub async fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        self.step("list interfaces", self.inner.inventory.list_interfaces())
            .await
    }

    /// Enable sharing, deciding confirmation from the access point policy.
    pub async fn enable_with_policy(
        &self,
        source: &str,
        target: &str,
        nat_enabled: bool,
    ) -> Result<String> {
        let require_confirmation = self.requires_confirmation(target);
        self.enable(source, target, nat_enabled, require_confirmation)
            .await
    }

    /// Share `source`'s connectivity onto `target`.
    ///
    /// Tears down whatever is applied first. With `require_confirmation`, the
    /// result is provisional and reverts unless confirmed in time. A failing
    /// backend step is reported but partially applied rules are left for the
    /// caller to retry or disable.
    pub async fn enable(
        &self,
        source: &str,
        target: &str,
        nat_enabled: bool,
        require_confirmation: bool,
    ) -> Result<String> {
        self.validate(source, target).await?;

        let mut locked = self.inner.locked.lock().await;
        let result = self
            .enable_locked(&mut locked, source, target, nat_enabled, require_confirmation)
            .await;
        self.publish(&locked);

        if let Err(ref e) = result {
            error!(source, target, "Error enabling connection sharing: {}", e);
        }
        result
    }

    /// Promote the pending configuration to current.
    pub async fn confirm(&self) -> Result<ConfirmOutcome> {
        let mut locked = self.inner.locked.lock().await;

        let Some(mut pending) = locked.store.read_pending()? else {
            info!("No pending connection sharing configuration to confirm");
            return Ok(ConfirmOutcome::NothingPending);
        };

        pending.confirm_deadline = None;
        let result = locked
            .store
            .write_current(&pending)
            .and_then(|()| locked.store.clear_pending());
        // The revert stays armed until the promotion is on disk.
        if result.is_ok() {
            locked.timer.cancel();
        }
        self.publish(&locked);
        result?;

        info!(
            source = pending.source.as_deref(),
            target = pending.target.as_deref(),
            "Connection sharing configuration confirmed"
        );
        Ok(ConfirmOutcome::Confirmed(pending))
    }

    /// Tear down any active or pending sharing and record the disabled state.
    pub async fn disable(&self, restart_services: bool) -> Result<String> {
        let mut locked = self.inner.locked.lock().await;
        let result = self.disable_locked(&mut locked, restart_services).await;
        self.publish(&locked);
        result?;
        Ok("Connection sharing disabled successfully".to_string())
    }

    /// Deal with a pending entry left over from before a restart.
    ///
    /// No timer survived, so the confirmation window is treated as missed and
    /// the entry is reverted at once. Returns whether anything was reverted.
    pub async fn recover(&self) -> Result<bool> {
        let mut locked = self.inner.locked.lock().await;

        let read = locked.store.read_pending();
        let pending = match read {
            Ok(pending) => pending,
            Err(e) => {
                error!("Unreadable pending state, disabling sharing: {}", e);
                locked.store.clear_pending()?;
                let result = self.disable_locked(&mut locked, true).await;
                self.publish(&locked);
                result?;
                return Ok(true);
            }
        };

        let Some(pending) = pending else {
            return Ok(false);
        };

        warn!(
            source = pending.source.as_deref(),
            target = pending.target.as_deref(),
            deadline = ?pending.confirm_deadline,
            "Unconfirmed connection sharing survived a restart"
        );
        self.revert_locked(&mut locked, pending).await;
        self.publish(&locked);
        Ok(true)
    }

    async fn validate(&self, source: &str, target: &str) -> Result<()> {
        if source.trim().is_empty() || target.trim().is_empty() {
            return Err(ShareError::Validation(
                "Source and target interfaces are required".into(),
            ));
        }
        if source == target {
            return Err(ShareError::Validation(
                "Source and target must be different interfaces".into(),
            ));
        }

        let known = self.interfaces().await?;
        for name in [source, target] {
            if !known.iter().any(|i| i.name == name) {
                return Err(ShareError::Validation(format!("Unknown interface: {}", name)));
            }
        }
        Ok(())
    }

    async fn enable_locked(
        &self,
        locked: &mut Locked,
        source: &str,
        target: &str,
        nat_enabled: bool,
        require_confirmation: bool,
    ) -> Result<String> {
        info!(
            source,
            target, nat_enabled, require_confirmation, "Enabling connection sharing"
        );

        // A pending entry is what is applied while one exists, so it is the
        // snapshot to restore, not the older current one.
        let previous = match locked.store.read_pending()? {
            Some(pending) => pending.snapshot(),
            None => locked.store.read_current()?.snapshot(),
        };

        self.disable_locked(locked, false).await?;

        let cfg = self
            .apply_locked(locked, source, target, nat_enabled, previous)
            .await?;

        if require_confirmation {
            let window = self.inner.options.confirmation_window;
            let mut pending = cfg;
            pending.confirm_deadline = chrono::Duration::from_std(window)
                .ok()
                .and_then(|d| Utc::now().checked_add_signed(d));
            locked.store.write_pending(&pending)?;
            self.arm_revert(locked, window);

            info!(
                source,
                target,
                "Connection sharing enabled temporarily, waiting for confirmation within {} seconds",
                window.as_secs()
            );
            Ok(format!(
                "Connection sharing enabled temporarily. Confirm within {} seconds or it will be reverted",
                window.as_secs()
            ))
        } else {
            locked.store.write_current(&cfg)?;
            info!(source, target, "Connection sharing enabled");
            Ok("Connection sharing enabled successfully".to_string())
        }
    }

    /// Bring up the uplink if needed, then apply NAT and access point DNS.
    async fn apply_locked(
        &self,
        locked: &mut Locked,
        source: &str,
        target: &str,
        nat_enabled: bool,
        previous: SharingConfig,
    ) -> Result<SharingConfig> {
        let backend = &self.inner.backend;

        // From here on the next teardown must reach these rules, whichever step fails.
        locked
            .store
            .write_current(&SharingConfig::attempt(source, target, nat_enabled))?;

        if self.inner.inventory.is_usb_interface(source).await {
            info!(source, "USB uplink detected, making sure it is up");
            if let Err(e) = self.step("bring up uplink", backend.bring_up(source)).await {
                warn!(source, "{}", e);
            }
        }

        let dns_servers = self.discover_dns(source).await;

        if nat_enabled {
            self.step("apply NAT", backend.apply_nat(source, target))
                .await?;
        }

        if self.inner.inventory.is_access_point_interface(target) {
            self.step(
                "configure access point DNS",
                backend.apply_access_point_dns(target, &dns_servers),
            )
            .await?;
            self.step(
                "restart access point daemons",
                backend.restart_access_point_daemons(),
            )
            .await?;
        }

        Ok(SharingConfig::new_active(
            source,
            target,
            nat_enabled,
            dns_servers,
            previous,
        ))
    }

    async fn discover_dns(&self, source: &str) -> Vec<IpAddr> {
        let discover = self.inner.backend.discover_upstream_dns(source);
        let servers = tokio::time::timeout(self.inner.options.backend_timeout, discover)
            .await
            .unwrap_or_default();

        if servers.is_empty() {
            let fallback = self.inner.options.fallback_dns.clone();
            info!(source, servers = ?fallback, "No DNS servers found, using fallback resolvers");
            fallback
        } else {
            servers
        }
    }

    async fn disable_locked(&self, locked: &mut Locked, restart_services: bool) -> Result<()> {
        let pending = locked.store.read_pending()?;
        let current = locked.store.read_current()?;

        // Rules may belong to the pending entry, the current one, or an apply
        // that failed part way. Each interface pair is torn down once.
        let mut applied: Vec<SharingConfig> = Vec::new();
        for cfg in pending.into_iter().chain(std::iter::once(current)) {
            let Some(pair) = cfg.rule_endpoints() else {
                continue;
            };
            if !applied.iter().any(|c| c.rule_endpoints() == Some(pair)) {
                applied.push(cfg);
            }
        }

        let inventory = &self.inner.inventory;
        let touched_access_point = applied
            .iter()
            .filter_map(|c| c.rule_endpoints())
            .any(|(_, target)| inventory.is_access_point_interface(target));

        if applied.is_empty() {
            // Still switches forwarding off.
            applied.push(SharingConfig::inactive());
        }

        let mut first_error = None;
        let mut residue = SharingConfig::inactive();
        for cfg in &applied {
            let teardown = self
                .step("tear down sharing", self.inner.backend.teardown_sharing(cfg))
                .await;
            if let Err(e) = teardown {
                if let Some((source, target)) = cfg.rule_endpoints() {
                    residue = SharingConfig::attempt(source, target, cfg.nat_enabled);
                }
                first_error.get_or_insert(e);
            }
        }

        if locked.timer.cancel() {
            debug!("Revert timer cancelled");
        }
        locked.store.clear_pending()?;
        // A failed teardown stays on record for the next disable to retry.
        locked.store.write_current(&residue)?;

        if restart_services && touched_access_point {
            if let Err(e) = self
                .step(
                    "restart access point daemons",
                    self.inner.backend.restart_access_point_daemons(),
                )
                .await
            {
                warn!("{}", e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        info!("Connection sharing disabled");
        Ok(())
    }

    fn arm_revert(&self, locked: &mut Locked, window: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        locked.timer.arm(window, move |id| async move {
            if let Some(inner) = weak.upgrade() {
                SharingManager { inner }.on_revert_timeout(id).await;
            }
        });
    }

    async fn on_revert_timeout(&self, timer_id: u64) {
        let mut locked = self.inner.locked.lock().await;

        // Confirmed, disabled or superseded while we waited for the lock.
        if !locked.timer.take_fired(timer_id) {
            debug!(timer_id, "Stale revert timer fired, ignoring");
            return;
        }

        let pending = locked.store.read_pending();
        match pending {
            Ok(Some(pending)) => {
                warn!(
                    source = pending.source.as_deref(),
                    target = pending.target.as_deref(),
                    "Confirmation window elapsed, reverting connection sharing"
                );
                self.revert_locked(&mut locked, pending).await;
            }
            Ok(None) => debug!("Revert timer fired with nothing pending"),
            Err(e) => {
                error!("Cannot read pending configuration, disabling sharing: {}", e);
                if let Err(e) = locked.store.clear_pending() {
                    error!("Cannot clear pending configuration: {}", e);
                }
                if let Err(e) = self.disable_locked(&mut locked, true).await {
                    error!("Error disabling connection sharing: {}", e);
                }
            }
        }

        self.publish(&locked);
    }

    /// Undo `pending` and re-apply what it replaced. Always ends with the
    /// pending slot cleared, even when restoring fails.
    async fn revert_locked(&self, locked: &mut Locked, pending: SharingConfig) {
        // Restoring over rules that failed to come down would lose track of them.
        let torn_down = match self.disable_locked(locked, false).await {
            Ok(()) => true,
            Err(e) => {
                error!("Error tearing down unconfirmed sharing, not restoring previous: {}", e);
                false
            }
        };

        let previous = pending.previous.as_deref().cloned().unwrap_or_default();
        let mut restarted = false;

        if let Some((source, target)) = previous.endpoints().filter(|_| torn_down) {
            info!(source, target, "Restoring previous connection sharing");
            match self
                .apply_locked(
                    locked,
                    source,
                    target,
                    previous.nat_enabled,
                    SharingConfig::inactive(),
                )
                .await
            {
                Ok(mut restored) => {
                    restored.previous = None;
                    if let Err(e) = locked.store.write_current(&restored) {
                        error!("Error recording restored configuration: {}", e);
                    }
                    restarted = self.inner.inventory.is_access_point_interface(target);
                }
                Err(e) => {
                    error!(
                        source,
                        target, "Restoring previous configuration failed, sharing left disabled: {}", e
                    );
                }
            }
        }

        let reverted_from_ap = pending
            .target
            .as_deref()
            .is_some_and(|t| self.inner.inventory.is_access_point_interface(t));
        if reverted_from_ap && !restarted {
            if let Err(e) = self
                .step(
                    "restart access point daemons",
                    self.inner.backend.restart_access_point_daemons(),
                )
                .await
            {
                warn!("{}", e);
            }
        }

        info!("Connection sharing configuration reverted");
    }

    /// Run one backend step under the configured timeout.
    async fn step<T, F>(&self, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let after = self.inner.options.backend_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ShareError::Validation(msg))) => Err(ShareError::Validation(msg)),
            Ok(Err(e)) => Err(ShareError::backend(step, e)),
            Err(_) => Err(ShareError::Timeout {
                step: step.to_string(),
                after,
            }),
        }
    }

    fn publish(&self, locked: &Locked) {
        let current = match locked.store.read_current() {
            Ok(current) => current,
            Err(e) => {
                warn!("Status not refreshed: {}", e);
                return;
            }
        };
        let read = locked.store.read_pending();
        let pending = match read {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Status not refreshed: {}", e);
                return;
            }
        };
        self.inner.snapshot.send_replace(Snapshot {
            current,
            pending,
            revert_at: locked.timer.fires_at(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::model::SharingState;
    use crate::sharing::store::{JsonFileStore, MemoryStore};
    use crate::system::network::StaticInventory;
    use crate::system::DryRunBackend;
    use std::sync::atomic::Ordering;

    const WINDOW: Duration = Duration::from_secs(60);

    fn options() -> ManagerOptions {
        ManagerOptions {
            confirmation_window: WINDOW,
            backend_timeout: Duration::from_secs(5),
            fallback_dns: vec!["8.8.8.8".parse().unwrap()],
        }
    }

    fn manager_with(
        store: Box<dyn ConfigStore>,
        backend: Arc<DryRunBackend>,
    ) -> SharingManager {
        let inventory = Arc::new(StaticInventory::new(
            &["eth0", "eth1", "usb0", "wlan0"],
            "wlan0",
            &["usb0"],
        ));
        SharingManager::new(store, backend, inventory, options()).unwrap()
    }

    fn setup() -> (SharingManager, Arc<DryRunBackend>) {
        let backend = Arc::new(DryRunBackend::new());
        let manager = manager_with(Box::new(MemoryStore::default()), backend.clone());
        (manager, backend)
    }

    fn pending_entry(source: &str, target: &str, previous: SharingConfig) -> SharingConfig {
        let mut cfg = SharingConfig::new_active(source, target, true, Vec::new(), previous);
        cfg.confirm_deadline = Some(Utc::now() - chrono::Duration::seconds(5));
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_without_access_point_is_active_immediately() {
        let (manager, backend) = setup();

        let message = manager.enable_with_policy("usb0", "eth0", true).await.unwrap();
        assert_eq!(message, "Connection sharing enabled successfully");

        let status = manager.status();
        assert_eq!(status.state(), SharingState::Active);
        assert_eq!(status.config.source.as_deref(), Some("usb0"));
        assert_eq!(status.remaining_seconds, None);
        assert_eq!(
            backend.operations(),
            vec![
                "teardown_sharing:-",
                "bring_up:usb0",
                "discover_upstream_dns:usb0",
                "apply_nat:usb0->eth0",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_point_target_waits_for_confirmation() {
        let (manager, backend) = setup();

        let message = manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();
        assert!(message.contains("60 seconds"));

        let status = manager.status();
        assert_eq!(status.state(), SharingState::PendingConfirmation);
        assert_eq!(status.remaining_seconds, Some(60));
        assert!(!status.config.previous.as_ref().unwrap().active);
        assert!(status.config.confirm_deadline.is_some());
        assert_eq!(backend.count("apply_access_point_dns:wlan0"), 1);
        assert_eq!(backend.count("restart_access_point_daemons"), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(manager.status().remaining_seconds, Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_keeps_configuration() {
        let (manager, backend) = setup();
        manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();

        let outcome = manager.confirm().await.unwrap();
        let ConfirmOutcome::Confirmed(cfg) = outcome else {
            panic!("expected confirmation");
        };
        assert_eq!(cfg.target.as_deref(), Some("wlan0"));

        tokio::time::sleep(WINDOW * 2).await;

        let status = manager.status();
        assert_eq!(status.state(), SharingState::Active);
        assert_eq!(status.config.source.as_deref(), Some("eth0"));
        assert_eq!(status.config.target.as_deref(), Some("wlan0"));
        assert!(!status.pending_confirmation);
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_change_reverts_to_disabled() {
        let (manager, backend) = setup();
        manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();

        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;

        let status = manager.status();
        assert_eq!(status.state(), SharingState::Disabled);
        assert!(!status.config.active);
        assert!(!status.pending_confirmation);
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 1);
        // Once for the enable, once after the revert.
        assert_eq!(backend.count("restart_access_point_daemons"), 2);

        assert_eq!(manager.confirm().await.unwrap(), ConfirmOutcome::NothingPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_change_restores_previous_sharing() {
        let (manager, backend) = setup();
        manager.enable("usb0", "eth0", true, false).await.unwrap();
        manager.enable_with_policy("eth1", "wlan0", true).await.unwrap();

        let status = manager.status();
        let previous = status.config.previous.as_ref().unwrap();
        assert_eq!(previous.source.as_deref(), Some("usb0"));
        assert!(previous.previous.is_none());

        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;

        let status = manager.status();
        assert_eq!(status.state(), SharingState::Active);
        assert_eq!(status.config.source.as_deref(), Some("usb0"));
        assert_eq!(status.config.target.as_deref(), Some("eth0"));
        assert!(status.config.previous.is_none());
        assert_eq!(backend.count("teardown_sharing:eth1->wlan0"), 1);
        assert_eq!(backend.count("apply_nat:usb0->eth0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_during_confirmation_cancels_revert() {
        let (manager, backend) = setup();
        manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();

        let message = manager.disable(true).await.unwrap();
        assert_eq!(message, "Connection sharing disabled successfully");
        assert_eq!(manager.status().state(), SharingState::Disabled);

        tokio::time::sleep(WINDOW * 2).await;

        assert_eq!(manager.status().state(), SharingState::Disabled);
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 1);
        assert_eq!(backend.count("restart_access_point_daemons"), 2);
        assert_eq!(manager.confirm().await.unwrap(), ConfirmOutcome::NothingPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_is_idempotent() {
        let (manager, backend) = setup();

        manager.disable(true).await.unwrap();
        manager.disable(true).await.unwrap();

        assert_eq!(manager.status().state(), SharingState::Disabled);
        assert_eq!(
            backend.operations(),
            vec!["teardown_sharing:-", "teardown_sharing:-"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_change_supersedes_pending_one() {
        let (manager, _backend) = setup();
        manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        manager.enable_with_policy("usb0", "wlan0", true).await.unwrap();
        let status = manager.status();
        assert_eq!(status.config.source.as_deref(), Some("usb0"));
        assert_eq!(status.remaining_seconds, Some(60));
        let previous = status.config.previous.as_ref().unwrap();
        assert_eq!(previous.source.as_deref(), Some("eth0"));
        assert!(previous.previous.is_none());

        // The first window would have closed here.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.status().state(), SharingState::PendingConfirmation);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let status = manager.status();
        assert_eq!(status.state(), SharingState::Active);
        assert_eq!(status.config.source.as_deref(), Some("eth0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_loses_race_to_running_revert() {
        let (manager, backend) = setup();
        manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();
        backend.stall_on("teardown_sharing", Duration::from_secs(3));

        // The revert starts at 60s and holds the lock until 63s.
        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;
        assert_eq!(manager.confirm().await.unwrap(), ConfirmOutcome::NothingPending);
        assert_eq!(manager.status().state(), SharingState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_wait_for_backend() {
        let (manager, backend) = setup();
        backend.stall_on("restart_access_point_daemons", Duration::from_secs(3));

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.enable_with_policy("eth0", "wlan0", true).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.status().state(), SharingState::Disabled);

        task.await.unwrap().unwrap();
        assert_eq!(manager.status().state(), SharingState::PendingConfirmation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_requests_touch_nothing() {
        let (manager, backend) = setup();

        for (source, target) in [("eth0", "eth0"), ("eth0", "ppp0"), ("", "wlan0")] {
            let err = manager.enable(source, target, true, true).await.unwrap_err();
            assert!(err.is_validation(), "{}: {}", source, err);
        }

        assert!(backend.operations().is_empty());
        assert_eq!(manager.status().state(), SharingState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_leaves_sharing_disabled() {
        let (manager, backend) = setup();
        backend.fail_on(Some("apply_nat"));

        let err = manager.enable_with_policy("eth0", "wlan0", true).await.unwrap_err();
        assert!(matches!(err, ShareError::Backend { ref step, .. } if step == "apply NAT"));

        tokio::time::sleep(WINDOW * 2).await;

        assert_eq!(manager.status().state(), SharingState::Disabled);
        assert_eq!(backend.count("teardown_sharing:-"), 1);
        assert_eq!(backend.count("restart_access_point_daemons"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_backend_step_times_out() {
        let (manager, backend) = setup();
        backend.stall_on("restart_access_point_daemons", Duration::from_secs(600));

        let err = manager.enable_with_policy("eth0", "wlan0", true).await.unwrap_err();
        assert!(
            matches!(err, ShareError::Timeout { ref step, .. } if step == "restart access point daemons")
        );
        assert_eq!(manager.status().state(), SharingState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restore_still_clears_pending() {
        let (manager, backend) = setup();
        manager.enable("usb0", "eth0", true, false).await.unwrap();
        manager.enable_with_policy("eth1", "wlan0", true).await.unwrap();
        backend.fail_on(Some("apply_nat"));

        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;

        let status = manager.status();
        assert_eq!(status.state(), SharingState::Disabled);
        assert!(!status.pending_confirmation);
        assert_eq!(manager.confirm().await.unwrap(), ConfirmOutcome::NothingPending);

        // The half restored NAT is still torn down by the next disable.
        backend.fail_on(None);
        manager.disable(true).await.unwrap();
        assert_eq!(backend.count("teardown_sharing:usb0->eth0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_enable_is_torn_down_by_next_disable() {
        let (manager, backend) = setup();
        backend.fail_on(Some("apply_access_point_dns"));

        let err = manager.enable_with_policy("eth0", "wlan0", true).await.unwrap_err();
        assert!(matches!(err, ShareError::Backend { .. }));
        assert_eq!(manager.status().state(), SharingState::Disabled);

        backend.fail_on(None);
        manager.disable(true).await.unwrap();
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 1);
        assert_eq!(backend.count("restart_access_point_daemons"), 1);

        manager.enable("usb0", "eth1", true, false).await.unwrap();
        manager.disable(true).await.unwrap();
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 1);
        assert_eq!(backend.count("teardown_sharing:usb0->eth1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_teardown_is_retried() {
        let (manager, backend) = setup();
        manager.enable("eth0", "usb0", true, false).await.unwrap();
        backend.fail_on(Some("teardown_sharing"));

        assert!(manager.disable(true).await.is_err());
        assert_eq!(manager.status().state(), SharingState::Disabled);

        backend.fail_on(None);
        manager.disable(true).await.unwrap();
        assert_eq!(backend.count("teardown_sharing:eth0->usb0"), 2);

        manager.disable(true).await.unwrap();
        assert_eq!(backend.count("teardown_sharing:eth0->usb0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_confirm_keeps_revert_armed() {
        let store = MemoryStore::default();
        let broken = store.write_failures();
        let backend = Arc::new(DryRunBackend::new());
        let manager = manager_with(Box::new(store), backend.clone());
        manager.enable_with_policy("eth0", "wlan0", true).await.unwrap();

        broken.store(true, Ordering::SeqCst);
        assert!(manager.confirm().await.is_err());
        let status = manager.status();
        assert!(status.pending_confirmation);
        assert!(status.remaining_seconds.is_some());

        broken.store(false, Ordering::SeqCst);
        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;

        assert_eq!(manager.status().state(), SharingState::Disabled);
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 1);
        assert_eq!(manager.confirm().await.unwrap(), ConfirmOutcome::NothingPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_reverts_leftover_pending() {
        let mut store = MemoryStore::default();
        let previous = SharingConfig::new_active("usb0", "eth0", true, Vec::new(), SharingConfig::inactive());
        store
            .write_pending(&pending_entry("eth0", "wlan0", previous.snapshot()))
            .unwrap();

        let backend = Arc::new(DryRunBackend::new());
        let manager = manager_with(Box::new(store), backend.clone());
        assert!(manager.status().pending_confirmation);

        assert!(manager.recover().await.unwrap());

        let status = manager.status();
        assert_eq!(status.state(), SharingState::Active);
        assert_eq!(status.config.source.as_deref(), Some("usb0"));
        assert_eq!(backend.count("teardown_sharing:eth0->wlan0"), 1);
        assert_eq!(backend.count("restart_access_point_daemons"), 1);

        assert!(!manager.recover().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_survives_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(DryRunBackend::new());

        let first = manager_with(
            Box::new(JsonFileStore::open(dir.path()).unwrap()),
            backend.clone(),
        );
        first.enable_with_policy("eth0", "wlan0", true).await.unwrap();
        drop(first);

        let second = manager_with(
            Box::new(JsonFileStore::open(dir.path()).unwrap()),
            backend.clone(),
        );
        let status = second.status();
        assert!(status.pending_confirmation);
        assert!(status.remaining_seconds.is_some());

        assert!(second.recover().await.unwrap());
        assert_eq!(second.status().state(), SharingState::Disabled);
        assert!(!dir.path().join(crate::sharing::store::PENDING_FILE).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_falls_back_when_discovery_finds_nothing() {
        let (manager, _) = setup();
        manager.enable("usb0", "eth0", false, false).await.unwrap();
        assert_eq!(
            manager.status().config.dns_servers,
            vec!["8.8.8.8".parse::<IpAddr>().unwrap()]
        );

        let backend = Arc::new(DryRunBackend::new().with_dns(vec!["192.168.8.1".parse().unwrap()]));
        let manager = manager_with(Box::new(MemoryStore::default()), backend.clone());
        manager.enable("usb0", "eth0", false, false).await.unwrap();
        assert_eq!(
            manager.status().config.dns_servers,
            vec!["192.168.8.1".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(backend.count("apply_nat:usb0->eth0"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_only_for_active_sharing() {
        let (manager, _) = setup();
        assert_eq!(manager.check_health().await, None);

        manager.enable("usb0", "eth0", true, false).await.unwrap();
        assert_eq!(manager.check_health().await, Some(HealthStatus::Healthy));
    }
}
