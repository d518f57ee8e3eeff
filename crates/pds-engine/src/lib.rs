//! The Engine (C7): process lifecycle, the control loop that drives the
//! Watcher, Classifier and Processor, and signal handling (§4.6).

mod backoff;
mod engine;
mod processor;

pub use backoff::{decide, RetryDecision};
pub use engine::{Engine, EngineOptions};
pub use processor::{Processor, ProcessorError};

use pds_core::types::SyncDir;
use std::path::{Path, PathBuf};

/// Resolves a raw local path back to the `SyncDir` it falls under, so the
/// Processor knows which `remote_root` to materialize ancestor folders
/// under (§4.3 step 1, §6 `sync_dirs`).
#[derive(Debug, Clone)]
pub struct SyncRootResolver {
    dirs: Vec<SyncDir>,
}

impl SyncRootResolver {
    pub fn new(dirs: Vec<SyncDir>) -> Self {
        Self { dirs }
    }

    pub fn sync_dirs(&self) -> &[SyncDir] {
        &self.dirs
    }

    pub fn root_for(&self, local_path: &str) -> Result<PathBuf, ProcessorError> {
        self.dirs
            .iter()
            .find(|d| local_path == d.source_path || local_path.starts_with(&format!("{}/", d.source_path)))
            .map(|d| PathBuf::from(&d.source_path))
            .ok_or_else(|| ProcessorError::UnknownRoot(local_path.to_string()))
    }

    pub fn remote_root_for(&self, root: &Path) -> Result<String, ProcessorError> {
        let root_str = root.to_string_lossy();
        self.dirs
            .iter()
            .find(|d| d.source_path == root_str)
            .map(|d| d.remote_root.clone())
            .ok_or_else(|| ProcessorError::UnknownRoot(root_str.into_owned()))
    }
}
