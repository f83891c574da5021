//! Checks for a provisioned GPU container host

use super::{Check, Group, Observation};
use crate::config::{HostConfig, RootLogin};
use crate::probe;
use crate::steps::ESSENTIAL_PACKAGES;
use crate::templates::docker::{DAEMON_JSON, string_key};
use crate::templates::files::{LIMITS_CONF, MONITOR_UNIT, MONITOR_UNIT_PATH, block};
use crate::templates::block_body;
use anyhow::Result;
use std::path::Path;
use syscmd::Executor;

/// Host facts that decide which groups apply
#[derive(Debug, Clone, Default)]
pub struct HostFacts {
    pub gpu_present: bool,
    pub target_user: Option<String>,
}

impl HostFacts {
    pub fn detect(exec: &Executor, config: &HostConfig) -> Self {
        let gpu_present = probe::has_nvidia_gpu(exec).unwrap_or_else(|e| {
            log::warn!("GPU detection failed: {e:#}");
            false
        });
        Self {
            gpu_present,
            target_user: config.resolve_target_user(probe::sudo_user().as_deref()),
        }
    }
}

fn observe(found: Option<String>, missing: impl Into<String>) -> Observation {
    found.map_or_else(|| Observation::Failed(missing.into()), Observation::Value)
}

fn daemon_key(group: &'static str, key: &'static str, expected: &str) -> Check {
    Check::new(group, format!("daemon.json {key}"), move |exec| {
        let content = exec.read_to_string(Path::new(DAEMON_JSON))?;
        Ok(match content {
            None => Observation::Failed(format!("{DAEMON_JSON} missing")),
            Some(text) => observe(string_key(&text, key), format!("{key} not set")),
        })
    })
    .equals(expected)
}

fn package(group: &'static str, name: &str) -> Check {
    Check::command(group, format!("{name} installed"), "dpkg-query", &["-W", "-f=${Status}", name])
        .equals("install ok installed")
}

/// Effective sshd value of `keyword` (lower-case, as printed by `sshd -T`).
fn sshd_effective(exec: &Executor, keyword: &str) -> Result<Observation> {
    let output = exec.probe("sshd", &["-T"])?;
    if !output.success() {
        return Ok(Observation::Failed(output.stderr_trimmed().to_string()));
    }
    let value = output.stdout.lines().find_map(|line| {
        let (key, value) = line.split_once(' ')?;
        (key == keyword).then(|| value.trim().to_string())
    });
    Ok(observe(value, format!("{keyword} not reported")))
}

/// Effective `PermitRootLogin`, with sshd's aliases folded to one spelling.
fn sshd_root_login(exec: &Executor) -> Result<Observation> {
    Ok(match sshd_effective(exec, "permitrootlogin")? {
        Observation::Value(raw) => match raw.parse::<RootLogin>() {
            Ok(policy) => Observation::Value(policy.as_str().to_string()),
            Err(()) => Observation::Value(raw),
        },
        failed @ Observation::Failed(_) => failed,
    })
}

fn system_group() -> Group {
    Group::new(
        "system",
        vec![
            Check::new("system", "Ubuntu 22.04", |exec| {
                let release = probe::os_release(exec)?;
                Ok(Observation::Value(format!("{} {}", release.id, release.version_id)))
            })
            .equals("ubuntu 22.04"),
            Check::command("system", "running as root", "id", &["-u"]).equals("0"),
        ],
    )
}

fn packages_group() -> Group {
    Group::new(
        "packages",
        ESSENTIAL_PACKAGES.iter().map(|name| package("packages", name)).collect(),
    )
}

fn docker_group(config: &HostConfig, facts: &HostFacts) -> Group {
    let mut checks = vec![
        Check::command("docker", "docker binary", "docker", &["--version"]),
        Check::command("docker", "docker service active", "systemctl", &["is-active", "docker"]).equals("active"),
        Check::command("docker", "docker service enabled", "systemctl", &["is-enabled", "docker"]).equals("enabled"),
        daemon_key("docker", "log-driver", "json-file"),
        daemon_key("docker", "storage-driver", &config.docker_storage_driver),
    ];
    if let Some(user) = facts.target_user.clone() {
        checks.push(
            Check::new("docker", format!("{user} in docker group"), move |exec| {
                let groups = probe::groups(exec, &user)?;
                Ok(if groups.iter().any(|g| g == "docker") {
                    Observation::Value("docker".to_string())
                } else {
                    Observation::Failed(groups.join(" "))
                })
            })
            .advisory(),
        );
    }
    Group::gated("docker", config.install_docker, checks)
}

fn gpu_group(config: &HostConfig, facts: &HostFacts) -> Group {
    let driver = config.nvidia_driver_version.clone();
    let checks = vec![
        Check::command("gpu", "nvidia-smi runs", "nvidia-smi", &["-L"]),
        Check::new("gpu", format!("driver branch {driver}"), |exec| {
            let output = exec.probe("nvidia-smi", &["--query-gpu=driver_version", "--format=csv,noheader"])?;
            if !output.success() {
                return Ok(Observation::Failed(output.stderr_trimmed().to_string()));
            }
            let version = output.stdout.lines().next().unwrap_or_default().trim();
            Ok(Observation::Value(version.split('.').next().unwrap_or_default().to_string()))
        })
        .equals(driver),
        package("gpu", "nvidia-container-toolkit"),
        daemon_key("gpu", "default-runtime", "nvidia"),
    ];
    Group::gated("gpu", config.install_nvidia && facts.gpu_present, checks)
}

fn kernel_group(config: &HostConfig) -> Group {
    let mut checks: Vec<Check> = config
        .sysctl_params()
        .into_iter()
        .map(|(key, value)| {
            Check::command("kernel", key.clone(), "sysctl", &["-n", &key]).equals(value)
        })
        .collect();
    checks.push(Check::new("kernel", "file descriptor limits", |exec| {
        let content = exec.read_to_string(Path::new(LIMITS_CONF))?.unwrap_or_default();
        Ok(observe(block_body(&content, block::LIMITS), format!("no gpuhost block in {LIMITS_CONF}")))
    }));
    Group::new("kernel", checks)
}

fn ssh_group(config: &HostConfig) -> Group {
    let root_login = config.permit_root_login.as_str();
    Group::new(
        "ssh",
        vec![
            Check::new("ssh", "PermitRootLogin", sshd_root_login).equals(root_login),
            Check::new("ssh", "MaxAuthTries", |exec| sshd_effective(exec, "maxauthtries"))
                .equals(config.max_auth_tries.to_string()),
            Check::new("ssh", "Port", |exec| sshd_effective(exec, "port")).equals(config.ssh_port.to_string()),
            Check::command("ssh", "ssh service active", "systemctl", &["is-active", "ssh"]).equals("active"),
        ],
    )
}

fn monitoring_group() -> Group {
    Group::new(
        "monitoring",
        vec![
            Check::new("monitoring", "monitor unit installed", |exec| {
                Ok(if exec.exists(Path::new(MONITOR_UNIT_PATH)) {
                    Observation::Value(MONITOR_UNIT_PATH.to_string())
                } else {
                    Observation::Failed(format!("{MONITOR_UNIT_PATH} missing"))
                })
            }),
            Check::command("monitoring", "monitor service active", "systemctl", &["is-active", MONITOR_UNIT])
                .equals("active"),
        ],
    )
}

fn vendor_group(config: &HostConfig) -> Group {
    let name = config.vendor_cli_name.clone();
    let lookup = format!("command -v {name}");
    Group::new(
        "vendor-cli",
        vec![
            Check::command("vendor-cli", format!("{name} installed"), "sh", &["-c", &lookup]),
            Check::command("vendor-cli", format!("{name} runs"), &name, &["--version"])
                .equals(format!("{name} {}", config.vendor_cli_version))
                .advisory(),
        ],
    )
}

fn network_group(config: &HostConfig) -> Group {
    let host = config.connectivity_host.clone();
    Group::new(
        "network",
        vec![
            Check::command("network", format!("reach {host}"), "ping", &["-c", "1", "-W", "5", &host]).advisory(),
        ],
    )
}

/// Every check group for a provisioned host, in report order.
pub fn host_checks(config: &HostConfig, facts: &HostFacts) -> Vec<Group> {
    vec![
        system_group(),
        packages_group(),
        docker_group(config, facts),
        gpu_group(config, facts),
        kernel_group(config),
        ssh_group(config),
        monitoring_group(),
        vendor_group(config),
        network_group(config),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{CheckStatus, run};
    use syscmd::CommandOutput;
    use syscmd::backend::scripted::ScriptedBackend;

    #[test]
    fn test_gpu_group_absent_without_gpu() {
        let config = HostConfig::default();
        let facts = HostFacts {
            gpu_present: false,
            target_user: None,
        };
        let exec = Executor::new(Box::new(ScriptedBackend::new()));
        let report = run(&exec, &host_checks(&config, &facts), |_| {});
        assert!(report.total > 0);
        assert!(report.results.iter().all(|r| r.group != "gpu"));
    }

    #[test]
    fn test_gpu_group_present_with_gpu() {
        let config = HostConfig::default();
        let facts = HostFacts {
            gpu_present: true,
            target_user: None,
        };
        let groups = host_checks(&config, &facts);
        let gpu = groups.iter().find(|g| g.name == "gpu").unwrap();
        assert!(gpu.open);
        assert_eq!(gpu.checks.len(), 4);
    }

    #[test]
    fn test_sshd_effective_values() {
        let backend = ScriptedBackend::new();
        backend.on("sshd -T", CommandOutput::ok("port 2222\npermitrootlogin no\nmaxauthtries 3\n"));
        let exec = Executor::new(Box::new(backend));
        let config = HostConfig {
            ssh_port: 2222,
            ..HostConfig::default()
        };

        let group = ssh_group(&config);
        let statuses: Vec<CheckStatus> = group.checks[..3].iter().map(|c| c.run(&exec).status).collect();
        assert_eq!(statuses, vec![CheckStatus::Pass; 3]);
    }

    #[test]
    fn test_root_login_alias_matches_configured_policy() {
        let backend = ScriptedBackend::new();
        backend.on("sshd -T", CommandOutput::ok("permitrootlogin without-password\n"));
        let exec = Executor::new(Box::new(backend));
        let config = HostConfig {
            permit_root_login: RootLogin::ProhibitPassword,
            ..HostConfig::default()
        };

        let result = ssh_group(&config).checks[0].run(&exec);
        assert_eq!(result.status, CheckStatus::Pass);
        assert_eq!(result.actual, "prohibit-password");

        let strict = HostConfig {
            permit_root_login: RootLogin::No,
            ..HostConfig::default()
        };
        assert_eq!(ssh_group(&strict).checks[0].run(&exec).status, CheckStatus::Fail);
    }

    #[test]
    fn test_driver_branch_check() {
        let backend = ScriptedBackend::new();
        backend.on("nvidia-smi --query-gpu", CommandOutput::ok("535.183.01\n"));
        let exec = Executor::new(Box::new(backend));
        let group = gpu_group(&HostConfig::default(), &HostFacts::default());
        assert_eq!(group.checks[1].run(&exec).status, CheckStatus::Pass);
    }

    #[test]
    fn test_daemon_key_reads_file() {
        let backend = ScriptedBackend::new();
        backend.with_file(DAEMON_JSON, "{\"log-driver\": \"journald\"}");
        let exec = Executor::new(Box::new(backend));
        let result = daemon_key("docker", "log-driver", "json-file").run(&exec);
        assert_eq!(result.status, CheckStatus::Fail);
        assert_eq!(result.actual, "journald");
    }
}
