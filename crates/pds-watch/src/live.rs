use crate::{exclude::ExcludeSet, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use pds_core::types::FileChange;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::sync::mpsc;

/// A live filesystem subscription under one sync root, debounced by the
/// write-settle interval `W` (§4.2, §5): a path that keeps changing does
/// not get reported until it has been quiet for `settle`.
pub struct LiveWatcher {
    _watcher: RecommendedWatcher,
    _debounce_task: tokio::task::JoinHandle<()>,
}

impl LiveWatcher {
    /// Start watching `root` recursively. Settled batches of [`FileChange`]
    /// are delivered on the returned channel.
    pub fn start(
        root: PathBuf,
        exclude: ExcludeSet,
        settle: Duration,
    ) -> Result<(Self, mpsc::Receiver<Vec<FileChange>>)> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<FileChange>>(16);

        let watcher_root = root.clone();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for path in event.paths {
                        let _ = raw_tx.send(path);
                    }
                }
                Err(e) => {
                    tracing::warn!(root = %watcher_root.display(), "watch error: {e}");
                }
            })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;

        let debounce_task = tokio::spawn(async move {
            let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
            let mut tick = tokio::time::interval(Duration::from_millis(
                (settle.as_millis() as u64 / 2).max(25),
            ));

            loop {
                tokio::select! {
                    maybe_path = raw_rx.recv() => {
                        match maybe_path {
                            Some(path) => {
                                if !exclude.is_excluded(&relative(&root, &path)) {
                                    pending.insert(path, Instant::now());
                                }
                            }
                            None => break,
                        }
                    }
                    _ = tick.tick() => {
                        let ready: Vec<PathBuf> = pending
                            .iter()
                            .filter(|(_, t)| t.elapsed() >= settle)
                            .map(|(p, _)| p.clone())
                            .collect();
                        if ready.is_empty() {
                            continue;
                        }
                        for path in &ready {
                            pending.remove(path);
                        }
                        let changes: Vec<FileChange> =
                            ready.into_iter().map(|p| observe(&p)).collect();
                        if batch_tx.send(changes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                _watcher: watcher,
                _debounce_task: debounce_task,
            },
            batch_rx,
        ))
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn observe(path: &Path) -> FileChange {
    let observed_at_ms = now_ms();
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            let mtime_ms = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(observed_at_ms);
            FileChange {
                path: path.to_string_lossy().into_owned(),
                exists: true,
                is_new: false,
                is_dir: metadata.is_dir(),
                mtime_ms,
                size: metadata.len(),
                observed_at_ms,
            }
        }
        Err(_) => FileChange {
            path: path.to_string_lossy().into_owned(),
            exists: false,
            is_new: false,
            is_dir: false,
            mtime_ms: 0,
            size: 0,
            observed_at_ms,
        },
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
