//! Configuration model (§6, expanded in SPEC_FULL §3.1).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::SyncDir;

fn default_sync_concurrency() -> usize {
    8
}

fn default_write_settle_ms() -> u64 {
    500
}

fn default_rename_window_ms() -> u64 {
    1000
}

fn default_state_db_path() -> PathBuf {
    xdg_state_dir().join("protondrive-sync").join("state.db")
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_metrics_addr() -> Option<String> {
    Some("127.0.0.1:9477".into())
}

fn xdg_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".local/state")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync_dirs: Vec<SyncDir>,

    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,

    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    #[serde(default = "default_write_settle_ms")]
    pub write_settle_ms: u64,

    #[serde(default = "default_rename_window_ms")]
    pub rename_window_ms: u64,

    #[serde(default = "default_state_db_path")]
    pub state_db_path: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: Option<String>,

    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_dirs: Vec::new(),
            sync_concurrency: default_sync_concurrency(),
            exclude_patterns: Vec::new(),
            write_settle_ms: default_write_settle_ms(),
            rename_window_ms: default_rename_window_ms(),
            state_db_path: default_state_db_path(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_addr: default_metrics_addr(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load and validate a config document from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot safely run with.
    ///
    /// Resolves the Open Question in spec §9: overlapping/nested sync roots
    /// are rejected rather than given unspecified behavior.
    pub fn validate(&self) -> Result<()> {
        if self.sync_dirs.is_empty() {
            return Err(Error::Config("sync_dirs must have at least one entry".into()));
        }
        if self.sync_concurrency == 0 {
            return Err(Error::Config("sync_concurrency must be >= 1".into()));
        }
        for pattern in &self.exclude_patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Config(format!("invalid exclude pattern '{pattern}': {e}")))?;
        }

        let roots: Vec<PathBuf> = self
            .sync_dirs
            .iter()
            .map(|d| PathBuf::from(&d.source_path))
            .collect();
        for (i, a) in roots.iter().enumerate() {
            for (j, b) in roots.iter().enumerate() {
                if i != j && (a == b || b.starts_with(a)) {
                    return Err(Error::Config(format!(
                        "overlapping sync roots: '{}' contains '{}'",
                        a.display(),
                        b.display()
                    )));
                }
            }
        }
        Ok(())
    }
}
