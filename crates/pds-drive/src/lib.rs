//! The DriveClient adapter (C6): the opaque remote-drive capability set
//! the Processor drives, plus the AuthProvider (§6) that yields one.

mod auth;
mod error;
mod local_fs;

pub use auth::{AuthProvider, NoOpAuthProvider};
pub use error::DriveError;
pub use local_fs::LocalFsDriveClient;

use async_trait::async_trait;
use pds_core::types::ErrorClass;

pub type Result<T> = std::result::Result<T, DriveError>;

/// Metadata attached to an upload; `mtime_ms` lets the remote side record
/// the original modification time where it supports it.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub mtime_ms: Option<i64>,
    pub mime_type: Option<String>,
}

/// One child entry returned by `iterate_children` (§6).
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub uid: String,
    pub name: String,
    pub is_directory: bool,
    pub active_revision: Option<RevisionInfo>,
}

/// `activeRevision.sha1` is hex, case-insensitive; absent for legacy files.
#[derive(Debug, Clone)]
pub struct RevisionInfo {
    pub sha1: Option<String>,
    pub size: Option<u64>,
}

/// Fields a `relocate` may change; both are optional so a pure rename and
/// a pure move are the same call with one field set.
#[derive(Debug, Clone, Default)]
pub struct Relocation {
    pub new_parent_uid: Option<String>,
    pub new_name: Option<String>,
}

/// Per-item outcome of a batch `trash`/`delete` call.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub uid: String,
    pub success: bool,
    pub error: Option<String>,
}

/// The remote drive's opaque capability set (§6). Every method returns a
/// typed success-or-error; the Processor (C5) is the single place that
/// turns a `DriveError` into an [`ErrorClass`] decision.
#[async_trait]
pub trait DriveClient: Send + Sync {
    async fn get_root_folder(&self) -> Result<String>;

    async fn iterate_children(&self, parent: &str) -> Result<Vec<NodeEntry>>;

    async fn create_folder(&self, parent: &str, name: &str, mtime_ms: Option<i64>) -> Result<String>;

    async fn upload_file(
        &self,
        parent: &str,
        name: &str,
        meta: &UploadMeta,
        content: &[u8],
    ) -> Result<String>;

    async fn upload_revision(&self, uid: &str, meta: &UploadMeta, content: &[u8]) -> Result<String>;

    async fn relocate(&self, uid: &str, relocation: &Relocation) -> Result<()>;

    async fn trash(&self, uids: &[String]) -> Result<Vec<ItemResult>>;

    async fn delete(&self, uids: &[String]) -> Result<Vec<ItemResult>>;
}

/// Classify a [`DriveError`] into the table in §4.4. This lives next to the
/// trait (not inside the Processor) because only the adapter knows which
/// concrete transport failures map to which class.
pub fn classify(err: &DriveError) -> ErrorClass {
    err.classify()
}
