//! Run configuration
//!
//! A `RunConfig` is built once at the edge (CLI flags plus config file) and
//! passed by reference into the runner and every step. Nothing reads run
//! flags from globals.

use std::collections::{BTreeMap, BTreeSet};

/// Immutable options for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    /// Report intended actions without mutating the host
    pub dry_run: bool,
    /// Show detailed output
    pub verbose: bool,
    /// Record step failures and keep going instead of aborting
    pub continue_on_error: bool,
    /// Step names not to run
    pub skip: BTreeSet<String>,
    /// Effective option overrides (name → value), for the run log
    pub overrides: BTreeMap<String, String>,
}

impl RunConfig {
    /// Create a default (live, fail-fast) configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set verbose mode.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set continue-on-error mode.
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Add a step to the skip set.
    pub fn skip(mut self, name: impl Into<String>) -> Self {
        self.skip.insert(name.into());
        self
    }

    /// Record an override.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Check whether a step is in the skip set.
    pub fn is_skipped(&self, name: &str) -> bool {
        self.skip.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_live_and_fail_fast() {
        let config = RunConfig::new();
        assert!(!config.dry_run);
        assert!(!config.continue_on_error);
        assert!(config.skip.is_empty());
    }

    #[test]
    fn test_skip_set() {
        let config = RunConfig::new().skip("nvidia").skip("docker");
        assert!(config.is_skipped("nvidia"));
        assert!(config.is_skipped("docker"));
        assert!(!config.is_skipped("backup"));
    }
}
