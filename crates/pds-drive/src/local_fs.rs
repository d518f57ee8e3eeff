use crate::{DriveClient, DriveError, ItemResult, NodeEntry, Relocation, UploadMeta};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

type Result<T> = std::result::Result<T, DriveError>;

/// A [`DriveClient`] backed by a real local directory tree, standing in
/// for the remote API in tests and local runs (§6: "a real SRP/OpenPGP-
/// backed provider is out of scope"). Node uids are synthetic and stable
/// for the lifetime of the client, independent of path — so a `relocate`
/// changes the path a uid maps to without changing the uid itself, the
/// same guarantee the real API gives.
pub struct LocalFsDriveClient {
    root_uid: String,
    paths: Mutex<HashMap<String, PathBuf>>,
}

impl LocalFsDriveClient {
    pub fn new(root: PathBuf) -> Self {
        let root_uid = "root".to_string();
        let mut paths = HashMap::new();
        paths.insert(root_uid.clone(), root);
        Self {
            root_uid,
            paths: Mutex::new(paths),
        }
    }

    fn path_for(&self, uid: &str) -> Result<PathBuf> {
        self.paths
            .lock()
            .unwrap()
            .get(uid)
            .cloned()
            .ok_or_else(|| DriveError::NotFound(uid.to_string()))
    }

    fn uid_for_path(&self, path: &std::path::Path) -> String {
        let mut paths = self.paths.lock().unwrap();
        if let Some((uid, _)) = paths.iter().find(|(_, p)| p.as_path() == path) {
            return uid.clone();
        }
        let uid = uuid::Uuid::new_v4().to_string();
        paths.insert(uid.clone(), path.to_path_buf());
        uid
    }

    fn rebind(&self, uid: &str, new_path: PathBuf) {
        let mut paths = self.paths.lock().unwrap();
        let old_path = paths.get(uid).cloned();
        if let Some(old_path) = old_path {
            // Descendants keep their uid but move with the parent.
            let rebind_targets: Vec<(String, PathBuf)> = paths
                .iter()
                .filter_map(|(u, p)| {
                    p.strip_prefix(&old_path)
                        .ok()
                        .map(|suffix| (u.clone(), new_path.join(suffix)))
                })
                .collect();
            for (u, p) in rebind_targets {
                paths.insert(u, p);
            }
        }
        paths.insert(uid.to_string(), new_path);
    }
}

#[async_trait]
impl DriveClient for LocalFsDriveClient {
    async fn get_root_folder(&self) -> Result<String> {
        Ok(self.root_uid.clone())
    }

    async fn iterate_children(&self, parent: &str) -> Result<Vec<NodeEntry>> {
        let parent_path = self.path_for(parent)?;
        let entries = std::fs::read_dir(&parent_path).map_err(|e| DriveError::Io(e.to_string()))?;

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| DriveError::Io(e.to_string()))?;
            let path = entry.path();
            let metadata = entry.metadata().map_err(|e| DriveError::Io(e.to_string()))?;
            let uid = self.uid_for_path(&path);
            out.push(NodeEntry {
                uid,
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                is_directory: metadata.is_dir(),
                active_revision: None,
            });
        }
        Ok(out)
    }

    async fn create_folder(&self, parent: &str, name: &str, _mtime_ms: Option<i64>) -> Result<String> {
        let parent_path = self.path_for(parent)?;
        let path = parent_path.join(name);
        std::fs::create_dir_all(&path).map_err(|e| DriveError::Io(e.to_string()))?;
        Ok(self.uid_for_path(&path))
    }

    async fn upload_file(
        &self,
        parent: &str,
        name: &str,
        _meta: &UploadMeta,
        content: &[u8],
    ) -> Result<String> {
        let parent_path = self.path_for(parent)?;
        let path = parent_path.join(name);
        std::fs::write(&path, content).map_err(|e| DriveError::Io(e.to_string()))?;
        Ok(self.uid_for_path(&path))
    }

    async fn upload_revision(&self, uid: &str, _meta: &UploadMeta, content: &[u8]) -> Result<String> {
        let path = self.path_for(uid)?;
        std::fs::write(&path, content).map_err(|e| DriveError::Io(e.to_string()))?;
        Ok(uid.to_string())
    }

    async fn relocate(&self, uid: &str, relocation: &Relocation) -> Result<()> {
        let old_path = self.path_for(uid)?;
        let new_parent = match &relocation.new_parent_uid {
            Some(parent_uid) => self.path_for(parent_uid)?,
            None => old_path
                .parent()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| DriveError::NotFound("no parent".into()))?,
        };
        let new_name = relocation
            .new_name
            .clone()
            .or_else(|| old_path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .ok_or_else(|| DriveError::NotFound("no name".into()))?;
        let new_path = new_parent.join(new_name);

        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DriveError::Io(e.to_string()))?;
        }
        std::fs::rename(&old_path, &new_path).map_err(|e| DriveError::Io(e.to_string()))?;
        self.rebind(uid, new_path);
        Ok(())
    }

    async fn trash(&self, uids: &[String]) -> Result<Vec<ItemResult>> {
        self.delete(uids).await
    }

    async fn delete(&self, uids: &[String]) -> Result<Vec<ItemResult>> {
        let mut out = Vec::new();
        for uid in uids {
            let result = match self.path_for(uid) {
                Ok(path) => {
                    let removed = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    match removed {
                        Ok(()) => {
                            self.paths.lock().unwrap().remove(uid);
                            ItemResult {
                                uid: uid.clone(),
                                success: true,
                                error: None,
                            }
                        }
                        Err(e) => ItemResult {
                            uid: uid.clone(),
                            success: false,
                            error: Some(e.to_string()),
                        },
                    }
                }
                Err(e) => ItemResult {
                    uid: uid.clone(),
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            out.push(result);
        }
        Ok(out)
    }
}
