use crate::{ExcludeSet, Result};
use pds_core::types::FileChange;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Recursively walk `root`, returning one [`FileChange`] per file or
/// directory found that is not excluded. Used for the startup scan-diff
/// pass and for one-shot (`--no-watch`) runs (§4.2).
///
/// `exists` is always `true` and `is_new` is always `false` here — whether
/// a path is new, changed, or gone (by its absence) is decided by the
/// Classifier comparing this list against the FileState table.
pub fn scan_dir(root: &Path, exclude: &ExcludeSet) -> Result<Vec<FileChange>> {
    let mut out = Vec::new();
    walk(root, root, exclude, &mut out)?;
    Ok(out)
}

fn walk(root: &Path, dir: &Path, exclude: &ExcludeSet, out: &mut Vec<FileChange>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        if exclude.is_excluded(&relative) {
            continue;
        }

        let metadata = entry.metadata()?;
        let observed_at_ms = now_ms();
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(observed_at_ms);

        if metadata.is_dir() {
            out.push(FileChange {
                path: path.to_string_lossy().into_owned(),
                exists: true,
                is_new: false,
                is_dir: true,
                mtime_ms,
                size: 0,
                observed_at_ms,
            });
            walk(root, &path, exclude, out)?;
        } else if metadata.is_file() {
            out.push(FileChange {
                path: path.to_string_lossy().into_owned(),
                exists: true,
                is_new: false,
                is_dir: false,
                mtime_ms,
                size: metadata.len(),
                observed_at_ms,
            });
        }
    }

    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let exclude = ExcludeSet::default();
        let changes = scan_dir(dir.path(), &exclude).unwrap();

        assert_eq!(changes.len(), 3);
        assert!(changes.iter().any(|c| c.is_dir && c.path.ends_with("sub")));
        assert!(changes
            .iter()
            .any(|c| !c.is_dir && c.path.ends_with("a.txt") && c.size == 5));
    }

    #[test]
    fn scan_honors_exclude_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        let exclude = ExcludeSet::compile(&["*.tmp".into()]).unwrap();
        let changes = scan_dir(dir.path(), &exclude).unwrap();

        assert_eq!(changes.len(), 1);
        assert!(changes[0].path.ends_with("a.txt"));
    }

    #[test]
    fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let exclude = ExcludeSet::default();
        assert!(scan_dir(&missing, &exclude).unwrap().is_empty());
    }
}
