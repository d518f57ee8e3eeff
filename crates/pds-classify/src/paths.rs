use pds_core::types::SyncDir;
use std::path::Path;

/// `rp = join(remoteRoot, basename(watchRoot), name)` (§4.3 step 1).
pub fn to_remote_path(sync_dir: &SyncDir, local_path: &str) -> String {
    let root = Path::new(&sync_dir.source_path);
    let basename = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let relative = Path::new(local_path)
        .strip_prefix(root)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();

    let mut parts = vec![sync_dir.remote_root.trim_matches('/').to_string(), basename];
    if !relative.is_empty() {
        parts.push(relative);
    }
    parts.retain(|p| !p.is_empty());
    parts.join("/")
}
