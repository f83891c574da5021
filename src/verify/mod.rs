//! Post-provisioning verification
//!
//! A read-only pass over live host state. Each [`Check`] runs a probe and
//! compares what it observed against an [`Expectation`]; results aggregate
//! into a [`Report`] with an overall [`Health`]. Nothing here raises on a
//! mismatch: every issue becomes a failed or warning result.

mod catalogue;

pub use catalogue::{HostFacts, host_checks};

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use syscmd::Executor;

/// Health thresholds on the success rate, in percent
pub const OK_THRESHOLD: f64 = 90.0;
pub const DEGRADED_THRESHOLD: f64 = 75.0;

/// What a probe saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The probe ran and succeeded; the value is its output
    Value(String),
    /// The probe ran but reported failure
    Failed(String),
}

/// A probe reads host state; `Err` means it could not run at all.
pub type Probe = Box<dyn Fn(&Executor) -> Result<Observation>>;

/// How an observation is judged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    /// The probe only has to succeed
    Succeeds,
    /// The probe's output must equal this, ignoring whitespace differences
    Equals(String),
}

/// Consequence of a mismatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Mismatch fails the check
    Required,
    /// Mismatch only warns
    Advisory,
}

/// A single declared verification
pub struct Check {
    pub group: &'static str,
    pub description: String,
    pub expectation: Expectation,
    pub severity: Severity,
    probe: Probe,
}

impl Check {
    /// Check with a custom probe.
    pub fn new(
        group: &'static str,
        description: impl Into<String>,
        probe: impl Fn(&Executor) -> Result<Observation> + 'static,
    ) -> Self {
        Self {
            group,
            description: description.into(),
            expectation: Expectation::Succeeds,
            severity: Severity::Required,
            probe: Box::new(probe),
        }
    }

    /// Check whose probe runs a command; its trimmed stdout is the observation.
    pub fn command(group: &'static str, description: impl Into<String>, program: &str, args: &[&str]) -> Self {
        let program = program.to_string();
        let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        Self::new(group, description, move |exec| {
            let argv: Vec<&str> = args.iter().map(String::as_str).collect();
            let output = exec.probe(&program, &argv)?;
            if output.success() {
                Ok(Observation::Value(output.stdout_trimmed().to_string()))
            } else {
                let detail = match output.stderr_trimmed() {
                    "" => output.stdout_trimmed().to_string(),
                    stderr => stderr.to_string(),
                };
                Ok(Observation::Failed(detail))
            }
        })
    }

    /// Require the observation to equal `expected`.
    pub fn equals(mut self, expected: impl Into<String>) -> Self {
        self.expectation = Expectation::Equals(expected.into());
        self
    }

    /// Downgrade mismatches to warnings.
    pub fn advisory(mut self) -> Self {
        self.severity = Severity::Advisory;
        self
    }

    /// Run the probe and judge the result.
    pub fn run(&self, exec: &Executor) -> CheckResult {
        let expected = match &self.expectation {
            Expectation::Succeeds => "success".to_string(),
            Expectation::Equals(value) => value.clone(),
        };
        let (status, actual) = match (self.probe)(exec) {
            Err(e) => (CheckStatus::Fail, format!("cannot run probe: {e:#}")),
            Ok(observation) => {
                let matched = match (&self.expectation, &observation) {
                    (Expectation::Succeeds, Observation::Value(_)) => true,
                    (Expectation::Equals(want), Observation::Value(got)) => normalize(want) == normalize(got),
                    (_, Observation::Failed(_)) => false,
                };
                let actual = match observation {
                    Observation::Value(v) if v.is_empty() => "success".to_string(),
                    Observation::Value(v) => v,
                    Observation::Failed(detail) if detail.is_empty() => "failed".to_string(),
                    Observation::Failed(detail) => format!("failed: {detail}"),
                };
                let status = match (matched, self.severity) {
                    (true, _) => CheckStatus::Pass,
                    (false, Severity::Required) => CheckStatus::Fail,
                    (false, Severity::Advisory) => CheckStatus::Warn,
                };
                (status, actual)
            }
        };
        log::debug!("[{}] {}: {status} (expected {expected}, got {actual})", self.group, self.description);
        CheckResult {
            group: self.group.to_string(),
            description: self.description.clone(),
            status,
            expected,
            actual,
        }
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A named set of checks, optionally gated on a host fact
pub struct Group {
    pub name: &'static str,
    /// Closed gates contribute no checks at all
    pub open: bool,
    pub checks: Vec<Check>,
}

impl Group {
    pub fn new(name: &'static str, checks: Vec<Check>) -> Self {
        Self {
            name,
            open: true,
            checks,
        }
    }

    pub fn gated(name: &'static str, open: bool, checks: Vec<Check>) -> Self {
        Self { name, open, checks }
    }
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Warn => "warn",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub group: String,
    pub description: String,
    pub status: CheckStatus,
    pub expected: String,
    pub actual: String,
}

/// Overall classification of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Ok,
    Degraded,
    Failed,
}

impl Health {
    pub fn from_rate(rate: f64) -> Self {
        if rate >= OK_THRESHOLD {
            Self::Ok
        } else if rate >= DEGRADED_THRESHOLD {
            Self::Degraded
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Degraded => "DEGRADED",
            Self::Failed => "FAILED",
        })
    }
}

/// Aggregated verification results
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub results: Vec<CheckResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub success_rate: f64,
    pub health: Health,
}

impl Report {
    pub fn from_results(results: Vec<CheckResult>) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let total = results.len();
        let passed = count(CheckStatus::Pass);
        let failed = count(CheckStatus::Fail);
        let warnings = count(CheckStatus::Warn);
        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total == 0 {
            100.0
        } else {
            passed as f64 / total as f64 * 100.0
        };
        Self {
            results,
            total,
            passed,
            failed,
            warnings,
            success_rate,
            health: Health::from_rate(success_rate),
        }
    }

    /// Zero failed checks.
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Run every check of every open group, in order.
pub fn run(exec: &Executor, groups: &[Group], mut on_check: impl FnMut(&Check)) -> Report {
    let mut results = Vec::new();
    for group in groups {
        if !group.open {
            log::info!("Skipping {} checks (not applicable on this host)", group.name);
            continue;
        }
        for check in &group.checks {
            on_check(check);
            results.push(check.run(exec));
        }
    }
    Report::from_results(results)
}
