//! iptables rule sets for NAT forwarding and access-point DNS.
//!
//! Rules are built as plain data first so the exact rule set can be tested
//! without touching the kernel. Applying checks with `-C` before adding, so a
//! retried enable never stacks duplicates; removal loops `-D` until iptables
//! reports the rule is gone.

use std::path::Path;

use tokio::fs;
use tracing::info;

use crate::error::Result;
use crate::system::command;

const IPTABLES: &str = "iptables";

/// How many identical copies `remove` will delete before giving up.
const MAX_DUPLICATES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// `-A`: end of chain.
    Append,
    /// `-I`: head of chain, ahead of any catch-all drop.
    Insert,
}

/// One iptables rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub placement: Placement,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            placement: Placement::Append,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn inserted(mut self) -> Self {
        self.placement = Placement::Insert;
        self
    }

    /// Arguments for iptables with the given action flag (`-A`, `-I`, `-C`, `-D`).
    pub fn args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.to_string(),
            action.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }

    fn add_action(&self) -> &'static str {
        match self.placement {
            Placement::Append => "-A",
            Placement::Insert => "-I",
        }
    }
}

/// Masquerade `source` egress and forward between `target` and `source`.
pub fn nat_rules(source: &str, target: &str) -> Vec<Rule> {
    vec![
        Rule::new("nat", "POSTROUTING", &["-o", source, "-j", "MASQUERADE"]),
        Rule::new(
            "filter",
            "FORWARD",
            &[
                "-i", source, "-o", target, "-m", "state", "--state", "RELATED,ESTABLISHED", "-j",
                "ACCEPT",
            ],
        ),
        Rule::new("filter", "FORWARD", &["-i", target, "-o", source, "-j", "ACCEPT"]),
        Rule::new(
            "filter",
            "FORWARD",
            &["-i", target, "-o", source, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
        ),
        Rule::new(
            "filter",
            "FORWARD",
            &["-i", target, "-o", source, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
        ),
    ]
}

/// Let access-point clients reach the local DNS forwarder.
pub fn access_point_dns_rules(target: &str) -> Vec<Rule> {
    vec![
        Rule::new("filter", "INPUT", &["-i", "lo", "-j", "ACCEPT"]).inserted(),
        Rule::new(
            "filter",
            "INPUT",
            &["-i", target, "-p", "udp", "--dport", "53", "-j", "ACCEPT"],
        )
        .inserted(),
        Rule::new(
            "filter",
            "INPUT",
            &["-i", target, "-p", "tcp", "--dport", "53", "-j", "ACCEPT"],
        )
        .inserted(),
    ]
}

/// Stateless iptables driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct Firewall;

impl Firewall {
    pub fn new() -> Self {
        Self
    }

    /// Whether the rule is currently installed.
    pub async fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        let args = rule.args("-C");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = command::output(IPTABLES, &args).await?;
        Ok(output.status.success())
    }

    /// Install the rule unless it is already present.
    pub async fn ensure(&self, rule: &Rule) -> Result<()> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        let args = rule.args(rule.add_action());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        command::run(IPTABLES, &args).await?;
        Ok(())
    }

    /// Delete every copy of the rule. Absent rules are not an error.
    pub async fn remove(&self, rule: &Rule) -> Result<()> {
        let args = rule.args("-D");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        for _ in 0..MAX_DUPLICATES {
            let output = command::output(IPTABLES, &args).await?;
            if !output.status.success() {
                break;
            }
        }
        Ok(())
    }

    pub async fn apply_all(&self, rules: &[Rule]) -> Result<()> {
        for rule in rules {
            self.ensure(rule).await?;
        }
        Ok(())
    }

    pub async fn remove_all(&self, rules: &[Rule]) -> Result<()> {
        for rule in rules {
            self.remove(rule).await?;
        }
        Ok(())
    }
}

/// Boot hook that reloads a saved rule set before interfaces come up.
fn restore_hook(rules_file: &Path) -> String {
    format!(
        "#!/bin/sh\niptables-restore < {}\nexit 0\n",
        rules_file.display()
    )
}

/// Save the live rule set to `rules_file` and make sure `hook` restores it on
/// boot. An existing hook is left as it is, and no hook is installed on hosts
/// without ifupdown's hook directory.
pub async fn save_rules(rules_file: &Path, hook: &Path) -> Result<()> {
    let saved = command::run("iptables-save", &[]).await?;
    fs::write(rules_file, saved).await?;

    let hook_dir = match hook.parent() {
        Some(dir) => fs::try_exists(dir).await?,
        None => false,
    };
    if !hook_dir || fs::try_exists(hook).await? {
        return Ok(());
    }
    fs::write(hook, restore_hook(rules_file)).await?;
    set_executable(hook).await?;
    info!(hook = %hook.display(), "Installed iptables restore hook");
    Ok(())
}

async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nat_rules() {
        let rules = nat_rules("usb0", "wlan0");
        assert_eq!(rules.len(), 5);
        assert_eq!(
            rules[0].args("-A"),
            vec!["-t", "nat", "-A", "POSTROUTING", "-o", "usb0", "-j", "MASQUERADE"]
        );
        assert_eq!(
            rules[2].args("-D"),
            vec!["-t", "filter", "-D", "FORWARD", "-i", "wlan0", "-o", "usb0", "-j", "ACCEPT"]
        );
        assert!(rules.iter().all(|r| r.placement == Placement::Append));
    }

    #[test]
    fn test_access_point_rules_are_inserted() {
        let rules = access_point_dns_rules("wlan0");
        assert!(rules.iter().all(|r| r.add_action() == "-I"));
        assert!(rules.iter().all(|r| r.chain == "INPUT"));
        assert!(rules[1].spec.contains(&"udp".to_string()));
    }

    #[test]
    fn test_restore_hook() {
        let hook = restore_hook(Path::new("/etc/iptables.ipv4.nat"));
        assert_eq!(hook, "#!/bin/sh\niptables-restore < /etc/iptables.ipv4.nat\nexit 0\n");
    }

    #[tokio::test]
    async fn test_set_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let hook = dir.path().join("iptables");
        std::fs::write(&hook, restore_hook(Path::new("/tmp/rules"))).unwrap();
        set_executable(&hook).await.unwrap();

        let mode = std::fs::metadata(&hook).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
