//! Per-store configuration
//!
//! Stored as `config.json` inside the `.vcs` directory (untracked), with
//! defaults for every field so a missing or partial file is fine.

use crate::error::{Result, VcsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Quiet period of inactivity before a batch of mutations is flushed
    /// to a commit, in milliseconds.
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,

    /// Optional cap on how long a continuous burst may keep deferring a
    /// flush. `None` keeps pure trailing-debounce behavior.
    #[serde(default)]
    pub max_batch_wait_ms: Option<u64>,

    /// Tables skipped by dumps (large or derived data, e.g. full-text
    /// index shadow tables). Their schema is still captured so a restore
    /// recreates them empty.
    #[serde(default)]
    pub exclude_units: BTreeSet<String>,

    /// Version-control executable used by the revision store.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

fn default_quiet_period_ms() -> u64 {
    500
}

fn default_git_binary() -> String {
    "git".to_string()
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
            max_batch_wait_ms: None,
            exclude_units: BTreeSet::new(),
            git_binary: default_git_binary(),
        }
    }
}

impl VcsConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn max_batch_wait(&self) -> Option<Duration> {
        self.max_batch_wait_ms.map(Duration::from_millis)
    }

    /// Load config from a `.vcs` directory, falling back to defaults when
    /// no file exists yet.
    pub fn load(vcs_dir: &Path) -> Result<Self> {
        let path = vcs_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data).map_err(|e| {
            VcsError::Configuration(format!("invalid config at {}: {e}", path.display()))
        })
    }

    /// Save config into a `.vcs` directory.
    pub fn save(&self, vcs_dir: &Path) -> Result<()> {
        let path = vcs_dir.join(CONFIG_FILE);
        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| VcsError::Configuration(e.to_string()))?;
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}
