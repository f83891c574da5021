//! Typed renderers for the remaining generated files

use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const SYSCTL_CONF: &str = "/etc/sysctl.conf";
pub const LIMITS_CONF: &str = "/etc/security/limits.conf";
pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
pub const MONITOR_UNIT: &str = "gpuhost-monitor.service";
pub const MONITOR_UNIT_PATH: &str = "/etc/systemd/system/gpuhost-monitor.service";
pub const MONITOR_SCRIPT: &str = "/usr/local/bin/gpuhost-monitor";
pub const NETPLAN_FILE: &str = "/etc/netplan/01-gpuhost-networkd.yaml";
pub const AUTO_UPGRADES: &str = "/etc/apt/apt.conf.d/20auto-upgrades";

/// Block ids used in shared files
pub mod block {
    pub const SYSCTL: &str = "sysctl";
    pub const LIMITS: &str = "limits";
    pub const SSH: &str = "ssh";
}

/// `key = value` lines for sysctl.conf, sorted by key.
pub fn sysctl_block(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k} = {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// File-descriptor limits for every account and for root (`*` excludes root).
pub fn limits_block(fd_limit: u64) -> String {
    let mut body = String::new();
    for domain in ["*", "root"] {
        for kind in ["soft", "hard"] {
            let _ = writeln!(body, "{domain:<8}{kind:<8}nofile  {fd_limit}");
        }
    }
    body.trim_end().to_string()
}

/// sshd options gpuhost enforces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshdSettings {
    pub port: u16,
    pub permit_root_login: &'static str,
    pub max_auth_tries: u32,
    /// `None` leaves the system's setting alone
    pub password_authentication: Option<bool>,
}

impl SshdSettings {
    /// Directives in the order they are written.
    pub fn directives(&self) -> Vec<(&'static str, String)> {
        let mut directives = vec![
            ("Port", self.port.to_string()),
            ("PermitRootLogin", self.permit_root_login.to_string()),
            ("MaxAuthTries", self.max_auth_tries.to_string()),
            ("PubkeyAuthentication", "yes".to_string()),
        ];
        if let Some(allow) = self.password_authentication {
            directives.push(("PasswordAuthentication", if allow { "yes" } else { "no" }.to_string()));
        }
        directives.extend([
            ("PermitEmptyPasswords", "no".to_string()),
            ("X11Forwarding", "no".to_string()),
            ("ClientAliveInterval", "300".to_string()),
            ("ClientAliveCountMax", "2".to_string()),
        ]);
        directives
    }

    pub fn block(&self) -> String {
        self.directives()
            .iter()
            .map(|(k, v)| format!("{k} {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A systemd service unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUnit {
    pub description: String,
    pub after: Vec<String>,
    pub wants: Vec<String>,
    pub exec_start: String,
    pub restart: &'static str,
    pub restart_sec: u32,
    pub wanted_by: &'static str,
}

impl ServiceUnit {
    pub fn render(&self) -> String {
        let mut unit = String::from("[Unit]\n");
        let _ = writeln!(unit, "Description={}", self.description);
        if !self.after.is_empty() {
            let _ = writeln!(unit, "After={}", self.after.join(" "));
        }
        if !self.wants.is_empty() {
            let _ = writeln!(unit, "Wants={}", self.wants.join(" "));
        }
        unit.push_str("\n[Service]\nType=simple\n");
        let _ = writeln!(unit, "ExecStart={}", self.exec_start);
        let _ = writeln!(unit, "Restart={}", self.restart);
        let _ = writeln!(unit, "RestartSec={}", self.restart_sec);
        unit.push_str("\n[Install]\n");
        let _ = writeln!(unit, "WantedBy={}", self.wanted_by);
        unit
    }
}

/// The host monitor service.
pub fn monitor_unit() -> ServiceUnit {
    ServiceUnit {
        description: "gpuhost resource monitor".into(),
        after: vec!["network-online.target".into(), "docker.service".into()],
        wants: vec!["network-online.target".into()],
        exec_start: MONITOR_SCRIPT.into(),
        restart: "always",
        restart_sec: 10,
        wanted_by: "multi-user.target",
    }
}

/// Script behind the monitor service: one status line per interval to the journal.
pub fn monitor_script(interval_secs: u64) -> String {
    format!(
        r#"#!/bin/sh
# Generated by gpuhost. Local edits are overwritten on the next run.
INTERVAL={interval_secs}

while true; do
    load=$(cut -d' ' -f1-3 /proc/loadavg)
    mem=$(free -m | awk '/^Mem:/ {{print $3 "/" $2 " MiB"}}')
    disk=$(df -h / | awk 'NR==2 {{print $5}}')
    containers=$(docker ps -q 2>/dev/null | wc -l)
    gpu="none"
    if command -v nvidia-smi >/dev/null 2>&1; then
        gpu=$(nvidia-smi --query-gpu=utilization.gpu,memory.used,temperature.gpu --format=csv,noheader 2>/dev/null | tr '\n' ';')
    fi
    echo "load=$load mem=$mem disk=$disk containers=$containers gpu=$gpu"
    sleep "$INTERVAL"
done
"#
    )
}

/// Placeholder installed in place of the vendor CLI.
pub fn vendor_cli_script(name: &str, version: &str) -> String {
    format!(
        r#"#!/bin/sh
# Generated by gpuhost: placeholder for {name} {version}.
case "$1" in
    --version|version)
        echo "{name} {version}"
        ;;
    *)
        echo "{name}: placeholder install, replace with the vendor release" >&2
        ;;
esac
"#
    )
}

/// Netplan config handing every wired interface to systemd-networkd over DHCP.
pub fn netplan_networkd(interfaces: &[String]) -> String {
    let mut yaml = String::from(
        "# Generated by gpuhost\nnetwork:\n  version: 2\n  renderer: networkd\n  ethernets:\n",
    );
    for iface in interfaces {
        let _ = writeln!(yaml, "    {iface}:\n      dhcp4: true\n      dhcp6: true");
    }
    yaml
}

/// Wired interfaces from `ip -o link show` output.
pub fn wired_interfaces(ip_link: &str) -> Vec<String> {
    ip_link
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(|name| name.trim().split('@').next().unwrap_or_default().to_string())
        .filter(|name| name.starts_with("en") || name.starts_with("eth"))
        .collect()
}

/// `20auto-upgrades`: daily list refresh and unattended upgrades.
pub fn auto_upgrades() -> String {
    [
        ("APT::Periodic::Update-Package-Lists", "1"),
        ("APT::Periodic::Download-Upgradeable-Packages", "1"),
        ("APT::Periodic::AutocleanInterval", "7"),
        ("APT::Periodic::Unattended-Upgrade", "1"),
    ]
    .iter()
    .map(|(k, v)| format!("{k} \"{v}\";\n"))
    .collect()
}

/// A one-line apt source.
pub fn apt_source(arch: &str, keyring: &str, url: &str, suite: &str, component: &str) -> String {
    format!("deb [arch={arch} signed-by={keyring}] {url} {suite} {component}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysctl_block_sorted() {
        let mut params = BTreeMap::new();
        params.insert("vm.swappiness".to_string(), "10".to_string());
        params.insert("fs.file-max".to_string(), "2097152".to_string());
        assert_eq!(sysctl_block(&params), "fs.file-max = 2097152\nvm.swappiness = 10");
    }

    #[test]
    fn test_limits_block_covers_root() {
        let body = limits_block(65536);
        assert_eq!(body.lines().count(), 4);
        assert!(body.lines().any(|l| l.starts_with("root") && l.contains("hard") && l.ends_with("65536")));
    }

    #[test]
    fn test_sshd_block_keeps_password_auth_when_unset() {
        let mut settings = SshdSettings {
            port: 2222,
            permit_root_login: "no",
            max_auth_tries: 3,
            password_authentication: None,
        };
        let block = settings.block();
        assert!(block.starts_with("Port 2222\nPermitRootLogin no\nMaxAuthTries 3"));
        assert!(!block.contains("PasswordAuthentication"));

        settings.password_authentication = Some(false);
        assert!(settings.block().contains("PasswordAuthentication no"));
    }

    #[test]
    fn test_monitor_unit() {
        let unit = monitor_unit().render();
        assert!(unit.contains("ExecStart=/usr/local/bin/gpuhost-monitor\n"));
        assert!(unit.contains("Restart=always\n"));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_scripts_embed_settings() {
        assert!(monitor_script(30).contains("INTERVAL=30\n"));
        assert!(monitor_script(30).contains("print $3 \"/\" $2"));
        assert!(vendor_cli_script("acme", "1.2.3").contains("echo \"acme 1.2.3\""));
    }

    #[test]
    fn test_wired_interfaces() {
        let ip = "1: lo: <LOOPBACK,UP> mtu 65536\n\
                  2: enp3s0: <BROADCAST,MULTICAST,UP> mtu 1500\n\
                  3: wlp2s0: <BROADCAST,MULTICAST> mtu 1500\n\
                  4: docker0: <NO-CARRIER> mtu 1500\n\
                  5: eth1@if7: <BROADCAST> mtu 1500\n";
        assert_eq!(wired_interfaces(ip), vec!["enp3s0", "eth1"]);

        let yaml = netplan_networkd(&wired_interfaces(ip));
        assert!(yaml.contains("renderer: networkd"));
        assert!(yaml.contains("    enp3s0:\n      dhcp4: true"));
    }

    #[test]
    fn test_auto_upgrades() {
        let content = auto_upgrades();
        assert!(content.contains("APT::Periodic::Unattended-Upgrade \"1\";\n"));
        assert_eq!(content.lines().count(), 4);
    }
}
