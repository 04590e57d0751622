//! Network interface inventory on Linux.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::system::{command, InterfaceInventory};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Information about a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ipv4_address: Option<String>,
    pub is_up: bool,
    /// Attached over USB (tethered phone, USB modem or dongle).
    pub is_usb: bool,
    /// Serves the management access point.
    pub is_access_point: bool,
}

/// Inventory backed by `ip` and sysfs.
pub struct LinuxInventory {
    access_point_interface: String,
}

impl LinuxInventory {
    pub fn new(access_point_interface: impl Into<String>) -> Self {
        Self {
            access_point_interface: access_point_interface.into(),
        }
    }
}

#[async_trait]
impl InterfaceInventory for LinuxInventory {
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        let links = command::run("ip", &["-o", "link", "show"]).await?;
        let addrs = command::run("ip", &["-o", "-4", "addr", "show"]).await?;
        let addresses = parse_ipv4_addresses(&addrs);

        let interfaces = parse_links(&links)
            .into_iter()
            .filter(|(name, _)| name != "lo")
            .map(|(name, is_up)| InterfaceInfo {
                ipv4_address: addresses.get(&name).cloned(),
                is_up,
                is_usb: is_usb_device(Path::new(SYS_CLASS_NET), &name),
                is_access_point: name == self.access_point_interface,
                name,
            })
            .collect();

        Ok(interfaces)
    }

    fn is_access_point_interface(&self, name: &str) -> bool {
        name == self.access_point_interface
    }

    async fn is_usb_interface(&self, name: &str) -> bool {
        is_usb_device(Path::new(SYS_CLASS_NET), name)
    }
}

/// A USB network device's sysfs link resolves through the USB bus,
/// e.g. `/sys/devices/platform/soc/.../usb1/1-1/1-1:1.0/net/usb0`.
fn is_usb_device(sys_class_net: &Path, name: &str) -> bool {
    std::fs::canonicalize(sys_class_net.join(name))
        .map(|p| p.to_string_lossy().contains("/usb"))
        .unwrap_or(false)
}

/// Parse `ip -o link show` into (name, is_up) pairs.
pub(crate) fn parse_links(output: &str) -> Vec<(String, bool)> {
    let mut links = Vec::new();

    for line in output.lines() {
        // Format: "3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ..."
        let mut fields = line.splitn(3, ": ");
        let (Some(_index), Some(name), Some(rest)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        // VLANs and veths print as "eth0.10@eth0"
        let name = name.split('@').next().unwrap_or(name).trim().to_string();

        let is_up = rest
            .strip_prefix('<')
            .and_then(|r| r.split_once('>'))
            .map(|(flags, _)| flags.split(',').any(|f| f == "UP"))
            .unwrap_or(false);

        links.push((name, is_up));
    }

    links
}

/// Parse `ip -o -4 addr show` into name -> first IPv4 address.
fn parse_ipv4_addresses(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();

    for line in output.lines() {
        // Format: "3: wlan0    inet 192.168.4.1/24 brd 192.168.4.255 scope global wlan0 ..."
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(inet_pos) = parts.iter().position(|p| *p == "inet") else {
            continue;
        };
        let (Some(name), Some(cidr)) = (parts.get(1), parts.get(inet_pos + 1)) else {
            continue;
        };
        let address = cidr.split('/').next().unwrap_or(cidr);
        map.entry(name.to_string())
            .or_insert_with(|| address.to_string());
    }

    map
}

/// Fixed interface list for state machine and API tests.
#[cfg(test)]
pub struct StaticInventory {
    names: Vec<String>,
    access_point: String,
    usb: Vec<String>,
}

#[cfg(test)]
impl StaticInventory {
    pub fn new(names: &[&str], access_point: &str, usb: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            access_point: access_point.to_string(),
            usb: usb.iter().map(|n| n.to_string()).collect(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl InterfaceInventory for StaticInventory {
    async fn list_interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(self
            .names
            .iter()
            .map(|name| InterfaceInfo {
                name: name.clone(),
                ipv4_address: None,
                is_up: true,
                is_usb: self.usb.contains(name),
                is_access_point: *name == self.access_point,
            })
            .collect())
    }

    fn is_access_point_interface(&self, name: &str) -> bool {
        name == self.access_point
    }

    async fn is_usb_interface(&self, name: &str) -> bool {
        self.usb.iter().any(|u| u == name)
    }
}
