use pds_core::types::{change_token, FileChange};
use std::collections::{HashMap, HashSet};

/// Diff a raw scan pass (every path currently on disk) against the stored
/// `FileState` token map, producing the `{exists, new}` observations
/// described in §4.2's scan-diff mode.
///
/// `known` maps `localPath -> changeToken` as currently persisted.
pub fn diff_scan(current: &[FileChange], known: &HashMap<String, String>) -> Vec<FileChange> {
    let mut out = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for change in current {
        seen.insert(change.path.as_str());

        if change.is_dir {
            if !known.contains_key(&change.path) {
                out.push(FileChange {
                    is_new: true,
                    ..change.clone()
                });
            }
            continue;
        }

        let token = change_token(change.mtime_ms, change.size);
        match known.get(&change.path) {
            None => out.push(FileChange {
                is_new: true,
                ..change.clone()
            }),
            Some(existing) if existing != &token => out.push(FileChange {
                is_new: false,
                ..change.clone()
            }),
            Some(_) => {} // token unchanged, no event
        }
    }

    for (path, _) in known {
        if !seen.contains(path.as_str()) {
            out.push(FileChange {
                path: path.clone(),
                exists: false,
                is_new: false,
                is_dir: false, // ambiguous; resolved at delete time via NodeMapping
                mtime_ms: 0,
                size: 0,
                observed_at_ms: current.first().map(|c| c.observed_at_ms).unwrap_or(0),
            });
        }
    }

    out
}

/// Diff a single live observation against the stored token, suppressing
/// settle-matched no-ops per §4.2's live mode.
pub fn diff_live(change: &FileChange, known: &HashMap<String, String>) -> Option<FileChange> {
    if !change.exists {
        return known.contains_key(&change.path).then(|| change.clone());
    }

    if change.is_dir {
        return (!known.contains_key(&change.path)).then(|| FileChange {
            is_new: true,
            ..change.clone()
        });
    }

    let token = change_token(change.mtime_ms, change.size);
    match known.get(&change.path) {
        None => Some(FileChange {
            is_new: true,
            ..change.clone()
        }),
        Some(existing) if existing != &token => Some(FileChange {
            is_new: false,
            ..change.clone()
        }),
        Some(_) => None,
    }
}
