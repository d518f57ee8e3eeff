use pds_core::types::{ErrorClass, EventType, FileHash, FileState, NodeMapping, SyncJob};
use pds_drive::{DriveClient, DriveError, Relocation, UploadMeta};
use pds_store::Store;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::backoff::{self, RetryDecision};
use crate::SyncRootResolver;

pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Timeout for metadata-only drive calls (§5).
const JSON_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for calls that move file bytes (§5).
const BINARY_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound a drive call so a wedged network request doesn't hold a pool slot
/// forever; a timeout surfaces as [`DriveError::Timeout`] and is retried
/// like any other transient network failure (§5, §4.4).
async fn with_timeout<T>(
    duration: Duration,
    call: impl Future<Output = pds_drive::Result<T>>,
) -> pds_drive::Result<T> {
    match tokio::time::timeout(duration, call).await {
        Ok(result) => result,
        Err(_) => Err(DriveError::Timeout(format!("drive call exceeded {duration:?}"))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error("store error: {0}")]
    Store(#[from] pds_store::Error),
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no sync root configured for {0}")]
    UnknownRoot(String),
    #[error("rename/move job for {0} is missing its old_local_path")]
    MissingRenameSource(String),
}

impl ProcessorError {
    fn classify(&self) -> pds_core::types::ErrorClass {
        match self {
            ProcessorError::Drive(e) => e.classify(),
            ProcessorError::MissingRenameSource(_) => pds_core::types::ErrorClass::ClientState,
            ProcessorError::Store(_) | ProcessorError::Io(_) | ProcessorError::UnknownRoot(_) => {
                pds_core::types::ErrorClass::Permanent
            }
        }
    }
}

/// The Processor (C5): a bounded pool of at most `K` in-flight job tasks
/// (§4.5, §5), driving the DriveClient through the per-event-kind
/// algorithms.
pub struct Processor {
    store: Store,
    drive: Arc<dyn DriveClient>,
    semaphore: Arc<Semaphore>,
    capacity: std::sync::atomic::AtomicUsize,
    roots: SyncRootResolver,
    dry_run: bool,
    retry_counts: [AtomicU64; 5],
}

impl Processor {
    pub fn new(
        store: Store,
        drive: Arc<dyn DriveClient>,
        concurrency: usize,
        roots: SyncRootResolver,
        dry_run: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            drive,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            capacity: std::sync::atomic::AtomicUsize::new(concurrency),
            roots,
            dry_run,
            retry_counts: Default::default(),
        })
    }

    /// Per-error-class retry/block counters since process start, in the
    /// same order as [`ErrorClass`]'s variants — surfaced on `/metrics`.
    pub fn retry_counts(&self) -> [(ErrorClass, u64); 5] {
        const CLASSES: [ErrorClass; 5] = [
            ErrorClass::TransientNetwork,
            ErrorClass::RateLimited,
            ErrorClass::ReuploadNeeded,
            ErrorClass::ClientState,
            ErrorClass::Permanent,
        ];
        std::array::from_fn(|i| (CLASSES[i], self.retry_counts[i].load(std::sync::atomic::Ordering::Relaxed)))
    }

    fn record_retry(&self, class: ErrorClass) {
        let idx = match class {
            ErrorClass::TransientNetwork => 0,
            ErrorClass::RateLimited => 1,
            ErrorClass::ReuploadNeeded => 2,
            ErrorClass::ClientState => 3,
            ErrorClass::Permanent => 4,
        };
        self.retry_counts[idx].fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// True once every permit is checked back in — no job in flight.
    pub fn idle(&self) -> bool {
        self.semaphore.available_permits() >= self.capacity.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// One control-loop tick (§4.5 step 1): claim ready jobs up to the
    /// available pool capacity and spawn a task per job. Non-blocking —
    /// returns as soon as the pool is full or the queue is empty.
    pub async fn tick(self: &Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return, // pool is full
            };

            match self.store.claim_job().await {
                Ok(Some(job)) => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    return;
                }
                Err(e) => {
                    tracing::error!("claim_job failed: {e}");
                    drop(permit);
                    return;
                }
            }
        }
    }

    async fn execute(&self, job: SyncJob) {
        tracing::info!(job_id = job.id, event = %job.event_type, path = %job.local_path, "processing job");

        if self.dry_run {
            tracing::info!(job_id = job.id, "dry-run: would {} {}", job.event_type, job.local_path);
            return;
        }

        let result = self.run_job(&job).await;
        match result {
            Ok(()) => {
                tracing::info!(job_id = job.id, "synced {}", job.local_path);
            }
            Err(err) => self.handle_failure(&job, err).await,
        }
    }

    async fn handle_failure(&self, job: &SyncJob, err: ProcessorError) {
        let class = err.classify();
        let decision = backoff::decide(class, job.n_retries, None);
        tracing::warn!(job_id = job.id, error = %err, class = %class, "job failed");
        self.record_retry(class);

        let outcome = match decision {
            RetryDecision::Retry(delay) => {
                self.store
                    .schedule_retry(job.id, now_ms() + delay.as_millis() as i64, &err.to_string())
                    .await
            }
            RetryDecision::ConvertAndRetry(delay) => {
                let converted = self.store.convert_to_delete_and_create(job.id).await;
                if let Err(e) = converted {
                    tracing::error!(job_id = job.id, "failed converting to DELETE_AND_CREATE: {e}");
                }
                self.store
                    .schedule_retry(job.id, now_ms() + delay.as_millis() as i64, &err.to_string())
                    .await
            }
            RetryDecision::Block => self.store.mark_blocked(job.id, &err.to_string()).await,
        };

        if let Err(e) = outcome {
            tracing::error!(job_id = job.id, "failed recording job outcome: {e}");
        }
    }

    async fn run_job(&self, job: &SyncJob) -> Result<()> {
        match job.event_type {
            EventType::Create if is_directory_job(job) => self.process_create_dir(job).await,
            EventType::Create | EventType::Update => self.process_create_or_update_file(job).await,
            EventType::Delete => self.process_delete(job).await,
            EventType::Rename => self.process_rename(job).await,
            EventType::Move => self.process_move(job).await,
            EventType::DeleteAndCreate => self.process_delete_and_create(job).await,
        }
    }

    async fn process_create_or_update_file(&self, job: &SyncJob) -> Result<()> {
        let path = Path::new(&job.local_path);
        let content = tokio::fs::read(path).await?;

        let parent_dir = path.parent().unwrap_or(path);
        let root = self.roots.root_for(&job.local_path)?;
        let parent_uid = self.ensure_ancestor_chain(&root, parent_dir).await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let existing = self.find_child(&parent_uid, &name).await?;
        let local_hash = match job.content_hash.clone() {
            Some(hash) => hash,
            None => pds_classify::sha1_hex(&job.local_path)?,
        };

        let node_uid = match &existing {
            Some(entry) if matches_hash(entry, &local_hash) => entry.uid.clone(),
            Some(entry) => {
                with_timeout(
                    BINARY_CALL_TIMEOUT,
                    self.drive.upload_revision(&entry.uid, &UploadMeta::default(), &content),
                )
                .await?
            }
            None => {
                with_timeout(
                    BINARY_CALL_TIMEOUT,
                    self.drive.upload_file(&parent_uid, &name, &UploadMeta::default(), &content),
                )
                .await?
            }
        };

        self.persist_success(
            job,
            NodeMapping {
                local_path: job.local_path.clone(),
                node_uid,
                parent_node_uid: parent_uid,
                is_directory: false,
                updated_at: 0,
            },
            Some(FileHash {
                local_path: job.local_path.clone(),
                content_hash: local_hash,
                updated_at: 0,
            }),
        )
        .await
    }

    async fn process_create_dir(&self, job: &SyncJob) -> Result<()> {
        let path = Path::new(&job.local_path);
        let root = self.roots.root_for(&job.local_path)?;
        let uid = self.ensure_ancestor_chain(&root, path).await?;
        let mapping = self.store.get_node_mapping(&job.local_path).await?;
        let parent_node_uid = mapping
            .map(|m| m.parent_node_uid)
            .unwrap_or_else(|| uid.clone());

        self.persist_success(
            job,
            NodeMapping {
                local_path: job.local_path.clone(),
                node_uid: uid,
                parent_node_uid,
                is_directory: true,
                updated_at: 0,
            },
            None,
        )
        .await
    }

    async fn process_delete(&self, job: &SyncJob) -> Result<()> {
        let mapping = self.store.get_node_mapping(&job.local_path).await?;
        if let Some(mapping) = mapping {
            let trashed = with_timeout(JSON_CALL_TIMEOUT, self.drive.trash(&[mapping.node_uid.clone()])).await?;
            if trashed.iter().any(|r| !r.success) {
                let _ = with_timeout(JSON_CALL_TIMEOUT, self.drive.delete(&[mapping.node_uid])).await?;
            }
        }
        // Absent remotely is treated as success (idempotent delete).
        if self.dry_run {
            return Ok(());
        }
        self.store
            .complete_job_delete(job.id, &job.local_path)
            .await?;
        Ok(())
    }

    async fn process_rename(&self, job: &SyncJob) -> Result<()> {
        let old_local_path = job
            .old_local_path
            .clone()
            .ok_or_else(|| ProcessorError::MissingRenameSource(job.local_path.clone()))?;

        let mapping = self
            .store
            .get_node_mapping(&old_local_path)
            .await?
            .ok_or(DriveError::MissingNodeMapping(old_local_path.clone()))?;

        let new_name = Path::new(&job.local_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        with_timeout(
            JSON_CALL_TIMEOUT,
            self.drive.relocate(
                &mapping.node_uid,
                &Relocation {
                    new_parent_uid: None,
                    new_name,
                },
            ),
        )
        .await?;

        self.rewrite_prefix(&old_local_path, &job.local_path).await?;

        self.persist_success(
            job,
            NodeMapping {
                local_path: job.local_path.clone(),
                node_uid: mapping.node_uid,
                parent_node_uid: mapping.parent_node_uid,
                is_directory: mapping.is_directory,
                updated_at: 0,
            },
            None,
        )
        .await
    }

    async fn process_move(&self, job: &SyncJob) -> Result<()> {
        let old_local_path = job
            .old_local_path
            .clone()
            .ok_or_else(|| ProcessorError::MissingRenameSource(job.local_path.clone()))?;

        let mapping = self
            .store
            .get_node_mapping(&old_local_path)
            .await?
            .ok_or(DriveError::MissingNodeMapping(old_local_path.clone()))?;

        let new_path = Path::new(&job.local_path);
        let new_parent_dir = new_path.parent().unwrap_or(new_path);
        let root = self.roots.root_for(&job.local_path)?;
        let new_parent_uid = self.ensure_ancestor_chain(&root, new_parent_dir).await?;
        let new_name = new_path.file_name().map(|n| n.to_string_lossy().into_owned());

        with_timeout(
            JSON_CALL_TIMEOUT,
            self.drive.relocate(
                &mapping.node_uid,
                &Relocation {
                    new_parent_uid: Some(new_parent_uid.clone()),
                    new_name,
                },
            ),
        )
        .await?;

        self.rewrite_prefix(&old_local_path, &job.local_path).await?;

        self.persist_success(
            job,
            NodeMapping {
                local_path: job.local_path.clone(),
                node_uid: mapping.node_uid,
                parent_node_uid: new_parent_uid,
                is_directory: mapping.is_directory,
                updated_at: 0,
            },
            None,
        )
        .await
    }

    async fn process_delete_and_create(&self, job: &SyncJob) -> Result<()> {
        if let Some(old_local_path) = &job.old_local_path {
            let mapping = self.store.get_node_mapping(old_local_path).await?;
            if let Some(mapping) = mapping {
                let _ = with_timeout(JSON_CALL_TIMEOUT, self.drive.trash(&[mapping.node_uid])).await;
            }
            self.store.complete_job_delete(job.id, old_local_path).await?;
        }
        self.process_create_or_update_file(job).await
    }

    /// Rewrite the FileHash/NodeMapping/FileState prefix for a directory
    /// subtree in one transaction (§4.1, §4.5 RENAME/MOVE).
    async fn rewrite_prefix(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.store.rename_prefix(old_path, new_path).await?;
        Ok(())
    }

    async fn persist_success(
        &self,
        job: &SyncJob,
        mapping: NodeMapping,
        hash: Option<FileHash>,
    ) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let state = FileState {
            local_path: job.local_path.clone(),
            change_token: current_change_token(&job.local_path)?,
            updated_at: 0,
        };
        self.store
            .complete_job_upsert(job.id, &mapping, hash.as_ref(), &state)
            .await?;
        Ok(())
    }

    /// Materialize (or find) every ancestor folder from the sync root down
    /// to `dir`, returning the uid of `dir` itself.
    async fn ensure_ancestor_chain(&self, root: &PathBuf, dir: &Path) -> Result<String> {
        let mut parent_uid = self.ensure_remote_root_prefix(root).await?;
        for ancestor in dir_chain(root, dir) {
            let local_path = ancestor.to_string_lossy().into_owned();
            if let Some(mapping) = self.store.get_node_mapping(&local_path).await? {
                parent_uid = mapping.node_uid;
                continue;
            }
            let name = ancestor
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let uid = self.find_or_create_folder(&parent_uid, &name).await?;
            self.store
                .upsert_node_mapping(&NodeMapping {
                    local_path,
                    node_uid: uid.clone(),
                    parent_node_uid: parent_uid.clone(),
                    is_directory: true,
                    updated_at: 0,
                })
                .await?;
            parent_uid = uid;
        }
        Ok(parent_uid)
    }

    /// Walk the `remote_root` path segments (outside the sync root's own
    /// subtree) from the drive's root, creating folders as needed.
    async fn ensure_remote_root_prefix(&self, root: &PathBuf) -> Result<String> {
        let remote_root = self.roots.remote_root_for(root)?;
        let mut parent_uid = with_timeout(JSON_CALL_TIMEOUT, self.drive.get_root_folder()).await?;
        for segment in remote_root.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            parent_uid = self.find_or_create_folder(&parent_uid, segment).await?;
        }
        Ok(parent_uid)
    }

    async fn find_or_create_folder(&self, parent_uid: &str, name: &str) -> Result<String> {
        if let Some(entry) = self.find_child(parent_uid, name).await? {
            return Ok(entry.uid);
        }
        Ok(with_timeout(JSON_CALL_TIMEOUT, self.drive.create_folder(parent_uid, name, None)).await?)
    }

    async fn find_child(&self, parent_uid: &str, name: &str) -> Result<Option<pds_drive::NodeEntry>> {
        let children = with_timeout(JSON_CALL_TIMEOUT, self.drive.iterate_children(parent_uid)).await?;
        Ok(children.into_iter().find(|c| c.name == name))
    }

    /// Applied live when `sync_concurrency` is reloaded (§4.6). Only the
    /// number of free slots changes; jobs already in flight keep running.
    pub fn resize(&self, new_capacity: usize) {
        let current = self.capacity.swap(new_capacity, std::sync::atomic::Ordering::Relaxed);
        if new_capacity > current {
            self.semaphore.add_permits(new_capacity - current);
        } else if new_capacity < current {
            let diff = (current - new_capacity) as u32;
            if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_many_owned(diff) {
                permit.forget();
            }
        }
    }
}

fn is_directory_job(job: &SyncJob) -> bool {
    // Directory CREATE jobs never carry a content hash; file CREATE jobs
    // always do (set by the Classifier at enqueue time).
    job.event_type == EventType::Create && job.content_hash.is_none()
}

fn matches_hash(entry: &pds_drive::NodeEntry, local_hash: &str) -> bool {
    entry
        .active_revision
        .as_ref()
        .and_then(|r| r.sha1.as_deref())
        .map(|remote| remote.eq_ignore_ascii_case(local_hash))
        .unwrap_or(false)
}

fn dir_chain(root: &Path, target_dir: &Path) -> Vec<PathBuf> {
    let mut chain = vec![root.to_path_buf()];
    if target_dir == root {
        return chain;
    }
    if let Ok(relative) = target_dir.strip_prefix(root) {
        let mut acc = root.to_path_buf();
        for component in relative.components() {
            acc = acc.join(component);
            chain.push(acc.clone());
        }
    }
    chain
}

fn current_change_token(local_path: &str) -> std::result::Result<String, std::io::Error> {
    let metadata = std::fs::metadata(local_path)?;
    let mtime_ms = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(pds_core::types::change_token(mtime_ms, metadata.len()))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pds_core::types::{JobState, SyncDir};
    use pds_drive::LocalFsDriveClient;

    #[test]
    fn dir_chain_includes_root_then_each_descendant() {
        let root = Path::new("/sync/docs");
        let target = Path::new("/sync/docs/a/b");
        let chain = dir_chain(root, target);
        assert_eq!(
            chain,
            vec![
                PathBuf::from("/sync/docs"),
                PathBuf::from("/sync/docs/a"),
                PathBuf::from("/sync/docs/a/b"),
            ]
        );
    }

    #[test]
    fn dir_chain_of_root_itself_is_a_single_entry() {
        let root = Path::new("/sync/docs");
        assert_eq!(dir_chain(root, root), vec![PathBuf::from("/sync/docs")]);
    }

    fn entry_with_sha1(sha1: &str) -> pds_drive::NodeEntry {
        pds_drive::NodeEntry {
            uid: "uid".into(),
            name: "a.txt".into(),
            is_directory: false,
            active_revision: Some(pds_drive::RevisionInfo {
                sha1: Some(sha1.to_string()),
                size: Some(3),
            }),
        }
    }

    #[test]
    fn matches_hash_is_case_insensitive() {
        let entry = entry_with_sha1("ABCDEF");
        assert!(matches_hash(&entry, "abcdef"));
        assert!(!matches_hash(&entry, "000000"));
    }

    #[test]
    fn matches_hash_is_false_without_a_revision() {
        let entry = pds_drive::NodeEntry {
            uid: "uid".into(),
            name: "a.txt".into(),
            is_directory: false,
            active_revision: None,
        };
        assert!(!matches_hash(&entry, "abcdef"));
    }

    async fn test_processor() -> (Arc<Processor>, tempfile::TempDir, tempfile::TempDir) {
        let sync_root = tempfile::tempdir().unwrap();
        let drive_root = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().await.unwrap();
        let drive = Arc::new(LocalFsDriveClient::new(drive_root.path().to_path_buf()));
        let sync_dir = SyncDir {
            source_path: sync_root.path().to_string_lossy().into_owned(),
            remote_root: "Backups".into(),
        };
        let roots = SyncRootResolver::new(vec![sync_dir]);
        let processor = Processor::new(store, drive, 4, roots, false);
        (processor, sync_root, drive_root)
    }

    #[tokio::test]
    async fn create_file_job_uploads_and_marks_synced() {
        let (processor, sync_root, drive_root) = test_processor().await;
        let local_path = sync_root.path().join("a.txt");
        std::fs::write(&local_path, b"hello").unwrap();

        let hash = pds_classify::sha1_hex(&local_path.to_string_lossy()).unwrap();
        let job_id = processor
            .store
            .enqueue_job(
                EventType::Create,
                &local_path.to_string_lossy(),
                "Backups/a.txt",
                None,
                None,
                Some(&hash),
            )
            .await
            .unwrap();

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        processor.execute(job).await;

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Synced);

        let uploaded = drive_root.path().join("Backups").join(
            sync_root.path().file_name().unwrap(),
        ).join("a.txt");
        assert_eq!(std::fs::read(uploaded).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn create_directory_job_creates_remote_folder() {
        let (processor, sync_root, drive_root) = test_processor().await;
        let local_dir = sync_root.path().join("subdir");
        std::fs::create_dir(&local_dir).unwrap();

        let job_id = processor
            .store
            .enqueue_job(
                EventType::Create,
                &local_dir.to_string_lossy(),
                "Backups/subdir",
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        processor.execute(job).await;

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Synced);

        let created = drive_root
            .path()
            .join("Backups")
            .join(sync_root.path().file_name().unwrap())
            .join("subdir");
        assert!(created.is_dir());
    }

    #[tokio::test]
    async fn delete_job_is_idempotent_when_nothing_mapped() {
        let (processor, sync_root, _drive_root) = test_processor().await;
        let local_path = sync_root.path().join("gone.txt");

        let job_id = processor
            .store
            .enqueue_job(
                EventType::Delete,
                &local_path.to_string_lossy(),
                "Backups/gone.txt",
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        processor.execute(job).await;

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Synced);
    }

    #[tokio::test]
    async fn rename_without_prior_mapping_is_client_state_and_retried() {
        let (processor, sync_root, _drive_root) = test_processor().await;
        let old_path = sync_root.path().join("old.txt");
        let new_path = sync_root.path().join("new.txt");
        std::fs::write(&new_path, b"x").unwrap();

        let job_id = processor
            .store
            .enqueue_job(
                EventType::Rename,
                &new_path.to_string_lossy(),
                "Backups/new.txt",
                Some(&old_path.to_string_lossy()),
                Some("Backups/old.txt"),
                None,
            )
            .await
            .unwrap();

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        processor.execute(job).await;

        let job = processor.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.n_retries, 1);
    }
}
