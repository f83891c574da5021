use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// State Structures
// ============================================================================

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Interrupted,
}

/// Record of one setup or convert run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// "setup" or "convert"
    pub sequence: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub status: RunStatus,
    /// Steps that executed, in order
    #[serde(default)]
    pub completed: Vec<String>,
    /// Step that stopped the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_point: Option<PathBuf>,
}

/// Persistent state tracking gpuhost runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Most recent live (non dry-run) run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunRecord>,

    /// Most recent restore point created by any run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restore_point: Option<PathBuf>,
}

// ============================================================================
// RunState Implementation
// ============================================================================

impl RunState {
    fn state_file(dir: &Path) -> PathBuf {
        dir.join("state.toml")
    }

    /// Load state from the default state directory
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::paths::state_dir())
    }

    /// Load state from disk, or return default if file doesn't exist
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = Self::state_file(dir);

        if !path.exists() {
            log::debug!("State file does not exist, using default state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    /// Save state to the default state directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&crate::paths::state_dir())
    }

    /// Save state to disk
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let path = Self::state_file(dir);
        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;

        fs::write(&path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    /// Record a finished run
    pub fn record(&mut self, run: RunRecord) {
        if let Some(path) = &run.restore_point {
            self.last_restore_point = Some(path.clone());
        }
        self.last_run = Some(run);
    }
}

// ============================================================================
// Tests
// ============================================================================
