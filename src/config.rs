//! Daemon configuration.
//!
//! Loads a small JSON config from `--config` or `~/.config/apshare/config.json`.
//! A missing file means defaults; a broken one is reported and then ignored.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Addressing handed out on the access-point network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPointSettings {
    /// Address of this host on the AP network; advertised as router and DNS.
    #[serde(default = "default_gateway")]
    pub gateway: Ipv4Addr,
    #[serde(default = "default_range_start")]
    pub dhcp_range_start: Ipv4Addr,
    #[serde(default = "default_range_end")]
    pub dhcp_range_end: Ipv4Addr,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
}

impl Default for AccessPointSettings {
    fn default() -> Self {
        Self {
            gateway: default_gateway(),
            dhcp_range_start: default_range_start(),
            dhcp_range_end: default_range_end(),
            netmask: default_netmask(),
            lease_time: default_lease_time(),
        }
    }
}

/// Persisted daemon settings.
///
/// Every field has a serde default so that adding new fields later
/// doesn't break old config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the HTTP API listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Directory holding the current and pending sharing state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// The interface serving the management network. Changes targeting it
    /// must be confirmed or they are rolled back.
    #[serde(default = "default_ap_interface")]
    pub access_point_interface: String,

    #[serde(default = "default_confirmation_window")]
    pub confirmation_window_secs: u64,

    /// Upper bound for any single backend step.
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    /// Resolvers used when none can be discovered on the uplink.
    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: Vec<IpAddr>,

    #[serde(default)]
    pub access_point: AccessPointSettings,

    #[serde(default = "default_dnsmasq_conf")]
    pub dnsmasq_conf: PathBuf,

    /// systemd units restarted after the access point is reconfigured.
    #[serde(default = "default_ap_services")]
    pub access_point_services: Vec<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/apshare")
}

fn default_ap_interface() -> String {
    "wlan0".to_string()
}

fn default_confirmation_window() -> u64 {
    60
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_fallback_dns() -> Vec<IpAddr> {
    vec![
        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    ]
}

fn default_gateway() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 4, 1)
}

fn default_range_start() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 4, 2)
}

fn default_range_end() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 4, 20)
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_lease_time() -> String {
    "24h".to_string()
}

fn default_dnsmasq_conf() -> PathBuf {
    PathBuf::from("/etc/dnsmasq.conf")
}

fn default_ap_services() -> Vec<String> {
    vec!["hostapd".to_string(), "dhcpcd".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_dir: default_state_dir(),
            access_point_interface: default_ap_interface(),
            confirmation_window_secs: default_confirmation_window(),
            backend_timeout_secs: default_backend_timeout(),
            fallback_dns: default_fallback_dns(),
            access_point: AccessPointSettings::default(),
            dnsmasq_conf: default_dnsmasq_conf(),
            access_point_services: default_ap_services(),
        }
    }
}

impl Config {
    /// Default config file path: `~/.config/apshare/config.json`.
    ///
    /// Returns `None` if the home/config directory can't be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("apshare").join("config.json"))
    }

    /// Load config from `path` (or the default path), falling back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Self::default(),
            },
        };

        let Ok(contents) = fs::read_to_string(&path) else {
            return Self::default();
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable config: {}", e);
                Self::default()
            }
        }
    }

    pub fn confirmation_window(&self) -> Duration {
        Duration::from_secs(self.confirmation_window_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}
