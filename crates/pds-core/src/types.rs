//! Shared data model: the rows persisted in the State Store (C1) and the
//! in-memory records passed between the Watcher, Classifier and Processor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// `"<mtime_ms>:<size>"` — cheap staleness check for a single path.
pub fn change_token(mtime_ms: i64, size: u64) -> String {
    format!("{mtime_ms}:{size}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Update,
    Delete,
    Rename,
    Move,
    DeleteAndCreate,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Rename => "RENAME",
            EventType::Move => "MOVE",
            EventType::DeleteAndCreate => "DELETE_AND_CREATE",
        };
        f.write_str(s)
    }
}

impl EventType {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CREATE" => EventType::Create,
            "UPDATE" => EventType::Update,
            "DELETE" => EventType::Delete,
            "RENAME" => EventType::Rename,
            "MOVE" => EventType::Move,
            "DELETE_AND_CREATE" => EventType::DeleteAndCreate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Processing,
    Synced,
    Blocked,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Processing => "PROCESSING",
            JobState::Synced => "SYNCED",
            JobState::Blocked => "BLOCKED",
        };
        f.write_str(s)
    }
}

impl JobState {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => JobState::Pending,
            "PROCESSING" => JobState::Processing,
            "SYNCED" => JobState::Synced,
            "BLOCKED" => JobState::Blocked,
            _ => return None,
        })
    }
}

/// Error classification table from §4.4 — decided by the Processor at the
/// single catch point per job, never by the DriveClient itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    TransientNetwork,
    RateLimited,
    ReuploadNeeded,
    ClientState,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::TransientNetwork => "TRANSIENT_NETWORK",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::ReuploadNeeded => "REUPLOAD_NEEDED",
            ErrorClass::ClientState => "CLIENT_STATE",
            ErrorClass::Permanent => "PERMANENT",
        };
        f.write_str(s)
    }
}

/// A durable row in the job queue (§3, SyncJob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub event_type: EventType,
    pub local_path: String,
    pub remote_path: String,
    pub old_local_path: Option<String>,
    pub old_remote_path: Option<String>,
    pub content_hash: Option<String>,
    pub state: JobState,
    pub n_retries: i64,
    pub retry_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

/// `localPath -> changeToken` (§3, FileState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub local_path: String,
    pub change_token: String,
    pub updated_at: i64,
}

/// `localPath -> contentHash` (§3, FileHash).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHash {
    pub local_path: String,
    pub content_hash: String,
    pub updated_at: i64,
}

/// `localPath -> { nodeUid, parentNodeUid, isDirectory }` (§3, NodeMapping).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMapping {
    pub local_path: String,
    pub node_uid: String,
    pub parent_node_uid: String,
    pub is_directory: bool,
    pub updated_at: i64,
}

/// A tag on the signal queue (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Stop,
    Pause,
    Resume,
    Reload,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::Stop => "stop",
            Signal::Pause => "pause",
            Signal::Resume => "resume",
            Signal::Reload => "reload",
        };
        f.write_str(s)
    }
}

impl Signal {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "stop" => Signal::Stop,
            "pause" => Signal::Pause,
            "resume" => Signal::Resume,
            "reload" => Signal::Reload,
            _ => return None,
        })
    }
}

/// One raw observation from the Watcher (C2), before classification.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub exists: bool,
    pub is_new: bool,
    pub is_dir: bool,
    pub mtime_ms: i64,
    pub size: u64,
    pub observed_at_ms: i64,
}

/// A configured sync root (§6 `sync_dirs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDir {
    pub source_path: String,
    pub remote_root: String,
}
