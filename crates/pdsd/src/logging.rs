//! Structured logging: a `tracing` subscriber writing to a size-rotated
//! file next to the state store, filtered by `RUST_LOG` or `config.log_level`
//! (§6 on-disk state layout).

use anyhow::{Context, Result};
use pds_core::config::Config;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Maximum log file size before rotation (spec: 1 MiB).
const MAX_LOG_SIZE: u64 = 1024 * 1024;

pub fn init(config: &Config) -> Result<WorkerGuard> {
    let log_path = log_path_for(config);
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating log dir {}", parent.display()))?;
    }
    rotate_if_needed(&log_path);

    let file_name = log_path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log path has no file name: {}", log_path.display()))?;
    let file_appender = tracing_appender::rolling::never(
        log_path.parent().unwrap_or_else(|| Path::new(".")),
        file_name,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }
    }

    Ok(guard)
}

fn log_path_for(config: &Config) -> PathBuf {
    config
        .state_db_path
        .parent()
        .map(|p| p.join("pdsd.log"))
        .unwrap_or_else(|| PathBuf::from("pdsd.log"))
}

/// Shift `pdsd.log` -> `pdsd.log.1` once it crosses [`MAX_LOG_SIZE`],
/// keeping one prior generation (spec: 1 MiB, 2 files retained).
/// Best-effort: a failed rotation still lets the daemon start.
fn rotate_if_needed(log_path: &Path) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < MAX_LOG_SIZE {
        return;
    }
    let rotated = log_path.with_extension(match log_path.extension() {
        Some(ext) => format!("{}.1", ext.to_string_lossy()),
        None => "1".to_string(),
    });
    let _ = std::fs::rename(log_path, rotated);
}
