//! The Change Classifier (C3): turns a diffed batch of `FileChange`
//! records into `SyncJob`s, persisting them via one transaction per batch
//! (§4.3).

mod hash;
mod paths;

pub use hash::sha1_hex;
pub use paths::to_remote_path;

use pds_core::types::{EventType, FileChange, SyncDir};
use pds_store::Store;
use std::collections::HashMap;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] pds_store::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One raw, not-yet-coalesced candidate job produced from a `FileChange`.
#[derive(Debug, Clone)]
struct Candidate {
    event_type: EventType,
    local_path: String,
    remote_path: String,
    old_local_path: Option<String>,
    old_remote_path: Option<String>,
    content_hash: Option<String>,
    observed_at_ms: i64,
}

/// Classify one already-diffed batch and persist the resulting jobs.
/// Returns the ids of the jobs that were inserted or updated.
///
/// `rename_window_ms` bounds the DELETE/CREATE correlation in
/// [`pair_renames_and_moves`]: a pair only becomes a RENAME/MOVE if their
/// `observed_at_ms` are within this many milliseconds of each other (§4.3
/// step 3, the rename/move correlation window *R*).
pub async fn classify_and_persist(
    store: &Store,
    sync_dir: &SyncDir,
    batch: &[FileChange],
    rename_window_ms: u64,
) -> Result<Vec<i64>> {
    let mut candidates = Vec::new();

    for change in batch {
        let remote_path = to_remote_path(sync_dir, &change.path);

        if !change.exists {
            // Type is ambiguous (§4.2); look up the last known content hash
            // for rename-pairing purposes.
            let content_hash = store
                .get_file_hash(&change.path)
                .await?
                .map(|h| h.content_hash);

            candidates.push(Candidate {
                event_type: EventType::Delete,
                local_path: change.path.clone(),
                remote_path,
                old_local_path: None,
                old_remote_path: None,
                content_hash,
                observed_at_ms: change.observed_at_ms,
            });
            continue;
        }

        if change.is_dir {
            if change.is_new {
                candidates.push(Candidate {
                    event_type: EventType::Create,
                    local_path: change.path.clone(),
                    remote_path,
                    old_local_path: None,
                    old_remote_path: None,
                    content_hash: None,
                    observed_at_ms: change.observed_at_ms,
                });
            }
            continue;
        }

        if change.is_new {
            let hash = sha1_hex(&change.path)?;
            candidates.push(Candidate {
                event_type: EventType::Create,
                local_path: change.path.clone(),
                remote_path,
                old_local_path: None,
                old_remote_path: None,
                content_hash: Some(hash),
                observed_at_ms: change.observed_at_ms,
            });
            continue;
        }

        // Existing file whose token changed: only a real content change
        // produces a job (§4.3 step 2).
        let hash = sha1_hex(&change.path)?;
        let stored_hash = store.get_file_hash(&change.path).await?;
        if stored_hash.map(|h| h.content_hash) == Some(hash.clone()) {
            continue;
        }
        candidates.push(Candidate {
            event_type: EventType::Update,
            local_path: change.path.clone(),
            remote_path,
            old_local_path: None,
            old_remote_path: None,
            content_hash: Some(hash),
            observed_at_ms: change.observed_at_ms,
        });
    }

    let candidates = pair_renames_and_moves(candidates, rename_window_ms);

    let mut job_ids = Vec::new();
    for candidate in candidates {
        job_ids.extend(persist_with_coalescing(store, candidate).await?);
    }
    Ok(job_ids)
}

/// Correlate DELETE/CREATE pairs with matching content, observed within
/// `rename_window_ms` of each other, into RENAME or MOVE jobs (§4.3 step 3).
fn pair_renames_and_moves(candidates: Vec<Candidate>, rename_window_ms: u64) -> Vec<Candidate> {
    let mut deletes: Vec<Candidate> = Vec::new();
    let mut creates: Vec<Candidate> = Vec::new();
    let mut rest: Vec<Candidate> = Vec::new();

    for c in candidates {
        match c.event_type {
            EventType::Delete => deletes.push(c),
            EventType::Create => creates.push(c),
            _ => rest.push(c),
        }
    }

    let mut used_creates = vec![false; creates.len()];
    let mut out = Vec::new();

    for delete in deletes {
        let mut matched = None;
        for (i, create) in creates.iter().enumerate() {
            if used_creates[i] {
                continue;
            }
            let within_window =
                (delete.observed_at_ms - create.observed_at_ms).unsigned_abs() <= rename_window_ms;
            if delete.content_hash.is_some() && delete.content_hash == create.content_hash && within_window {
                matched = Some(i);
                break;
            }
        }

        match matched {
            Some(i) => {
                used_creates[i] = true;
                let create = &creates[i];
                let same_parent = parent_of(&delete.local_path) == parent_of(&create.local_path);
                out.push(Candidate {
                    event_type: if same_parent {
                        EventType::Rename
                    } else {
                        EventType::Move
                    },
                    local_path: create.local_path.clone(),
                    remote_path: create.remote_path.clone(),
                    old_local_path: Some(delete.local_path.clone()),
                    old_remote_path: Some(delete.remote_path.clone()),
                    content_hash: create.content_hash.clone(),
                    observed_at_ms: create.observed_at_ms,
                });
            }
            None => out.push(delete),
        }
    }

    for (i, create) in creates.into_iter().enumerate() {
        if !used_creates[i] {
            out.push(create);
        }
    }

    out.extend(rest);
    out
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

/// Apply the coalescing rule (§4.3 step 4) against any existing non-SYNCED
/// job for the same path, then persist. Returns every job id touched: one
/// for a merge, or the new job's id alone when the incoming change is kept
/// as a distinct pending job (`RENAME+UPDATE` and `MOVE+UPDATE`).
async fn persist_with_coalescing(store: &Store, candidate: Candidate) -> Result<Vec<i64>> {
    let existing = store.active_job_for_path(&candidate.local_path).await?;

    let Some(existing) = existing else {
        let id = store
            .enqueue_job(
                candidate.event_type,
                &candidate.local_path,
                &candidate.remote_path,
                candidate.old_local_path.as_deref(),
                candidate.old_remote_path.as_deref(),
                candidate.content_hash.as_deref(),
            )
            .await?;
        return Ok(vec![id]);
    };

    match coalesce(existing.event_type, candidate.event_type) {
        Coalesced::MergeInto(resolved) => {
            store
                .update_job_fields(
                    existing.id,
                    resolved,
                    &candidate.remote_path,
                    candidate
                        .old_local_path
                        .as_deref()
                        .or(existing.old_local_path.as_deref()),
                    candidate
                        .old_remote_path
                        .as_deref()
                        .or(existing.old_remote_path.as_deref()),
                    candidate.content_hash.as_deref(),
                )
                .await?;
            Ok(vec![existing.id])
        }
        Coalesced::KeepSeparate => {
            let id = store
                .enqueue_job(
                    candidate.event_type,
                    &candidate.local_path,
                    &candidate.remote_path,
                    candidate.old_local_path.as_deref(),
                    candidate.old_remote_path.as_deref(),
                    candidate.content_hash.as_deref(),
                )
                .await?;
            Ok(vec![id])
        }
    }
}

/// Outcome of matching an incoming candidate against an existing active job.
#[derive(Debug, PartialEq, Eq)]
enum Coalesced {
    MergeInto(EventType),
    KeepSeparate,
}

/// §4.3 step 4's coalescing table. `RENAME+UPDATE` and `MOVE+UPDATE` are
/// kept as two distinct jobs rather than merged into one row: the RENAME/
/// MOVE job keeps running against the old content hash, and the UPDATE is
/// enqueued separately as its own pending job for the same path.
fn coalesce(existing: EventType, incoming: EventType) -> Coalesced {
    use EventType::*;
    match (existing, incoming) {
        (_, Delete) => Coalesced::MergeInto(Delete),
        (Delete, Create) => Coalesced::MergeInto(DeleteAndCreate),
        (Create, Update) => Coalesced::MergeInto(Create),
        (Update, Update) => Coalesced::MergeInto(Update),
        (Rename, Update) | (Move, Update) => Coalesced::KeepSeparate,
        (_, incoming) => Coalesced::MergeInto(incoming),
    }
}

/// Build the `localPath -> changeToken` map the Watcher's diff pass needs,
/// scoped to one sync root.
pub async fn known_tokens_under(store: &Store, prefix: &str) -> Result<HashMap<String, String>> {
    Ok(store
        .file_states_with_prefix(prefix)
        .await?
        .into_iter()
        .map(|s| (s.local_path, s.change_token))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pds_core::types::NodeMapping;

    fn change(path: &str, exists: bool, is_new: bool, is_dir: bool, mtime: i64, size: u64) -> FileChange {
        FileChange {
            path: path.into(),
            exists,
            is_new,
            is_dir,
            mtime_ms: mtime,
            size,
            observed_at_ms: 1_000,
        }
    }

    #[test]
    fn coalesce_create_then_update_stays_create() {
        assert_eq!(
            coalesce(EventType::Create, EventType::Update),
            Coalesced::MergeInto(EventType::Create)
        );
    }

    #[test]
    fn coalesce_anything_then_delete_is_delete() {
        assert_eq!(
            coalesce(EventType::Update, EventType::Delete),
            Coalesced::MergeInto(EventType::Delete)
        );
    }

    #[test]
    fn coalesce_delete_then_create_is_delete_and_create() {
        assert_eq!(
            coalesce(EventType::Delete, EventType::Create),
            Coalesced::MergeInto(EventType::DeleteAndCreate)
        );
    }

    #[test]
    fn coalesce_rename_then_update_is_kept_separate() {
        assert_eq!(coalesce(EventType::Rename, EventType::Update), Coalesced::KeepSeparate);
        assert_eq!(coalesce(EventType::Move, EventType::Update), Coalesced::KeepSeparate);
    }

    #[tokio::test]
    async fn create_file_is_classified_and_hashed() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let store = Store::open_in_memory().await.unwrap();
        let sync_dir = SyncDir {
            source_path: dir.path().to_string_lossy().into_owned(),
            remote_root: "backups".into(),
        };
        let batch = vec![change(
            file_path.to_str().unwrap(),
            true,
            true,
            false,
            100,
            5,
        )];

        let ids = classify_and_persist(&store, &sync_dir, &batch, 1_000).await.unwrap();
        assert_eq!(ids.len(), 1);

        let job = store.get_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.event_type, EventType::Create);
        assert!(job.content_hash.is_some());
    }

    #[tokio::test]
    async fn unchanged_hash_drops_the_update() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();
        let hash = sha1_hex(file_path.to_str().unwrap()).unwrap();

        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_file_hash(file_path.to_str().unwrap(), &hash)
            .await
            .unwrap();

        let sync_dir = SyncDir {
            source_path: dir.path().to_string_lossy().into_owned(),
            remote_root: "backups".into(),
        };
        let batch = vec![change(
            file_path.to_str().unwrap(),
            true,
            false,
            false,
            200,
            5,
        )];

        let ids = classify_and_persist(&store, &sync_dir, &batch, 1_000).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn delete_then_create_same_content_is_a_rename() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old.txt");
        let new_path = dir.path().join("new.txt");
        std::fs::write(&new_path, b"hello").unwrap();
        let hash = sha1_hex(new_path.to_str().unwrap()).unwrap();

        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_file_hash(old_path.to_str().unwrap(), &hash)
            .await
            .unwrap();
        store
            .upsert_node_mapping(&NodeMapping {
                local_path: old_path.to_string_lossy().into_owned(),
                node_uid: "node-1".into(),
                parent_node_uid: "root".into(),
                is_directory: false,
                updated_at: 0,
            })
            .await
            .unwrap();

        let sync_dir = SyncDir {
            source_path: dir.path().to_string_lossy().into_owned(),
            remote_root: "backups".into(),
        };
        let batch = vec![
            change(old_path.to_str().unwrap(), false, false, false, 0, 0),
            change(new_path.to_str().unwrap(), true, true, false, 100, 5),
        ];

        let ids = classify_and_persist(&store, &sync_dir, &batch, 1_000).await.unwrap();
        assert_eq!(ids.len(), 1);
        let job = store.get_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.event_type, EventType::Rename);
        assert_eq!(job.old_local_path.as_deref(), Some(old_path.to_str().unwrap()));
    }

    #[tokio::test]
    async fn delete_then_create_outside_the_window_stays_a_delete_and_a_create() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old.txt");
        let new_path = dir.path().join("new.txt");
        std::fs::write(&new_path, b"hello").unwrap();
        let hash = sha1_hex(new_path.to_str().unwrap()).unwrap();

        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_file_hash(old_path.to_str().unwrap(), &hash)
            .await
            .unwrap();
        store
            .upsert_node_mapping(&NodeMapping {
                local_path: old_path.to_string_lossy().into_owned(),
                node_uid: "node-1".into(),
                parent_node_uid: "root".into(),
                is_directory: false,
                updated_at: 0,
            })
            .await
            .unwrap();

        let sync_dir = SyncDir {
            source_path: dir.path().to_string_lossy().into_owned(),
            remote_root: "backups".into(),
        };
        let mut delete = change(old_path.to_str().unwrap(), false, false, false, 0, 0);
        delete.observed_at_ms = 0;
        let mut create = change(new_path.to_str().unwrap(), true, true, false, 100, 5);
        create.observed_at_ms = 5_000;
        let batch = vec![delete, create];

        let ids = classify_and_persist(&store, &sync_dir, &batch, 1_000).await.unwrap();
        assert_eq!(ids.len(), 2);
        let mut events = Vec::new();
        for id in &ids {
            events.push(store.get_job(*id).await.unwrap().unwrap().event_type);
        }
        assert!(events.contains(&EventType::Delete));
        assert!(events.contains(&EventType::Create));
    }

    #[tokio::test]
    async fn rename_then_content_change_keeps_two_distinct_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("old.txt");
        let new_path = dir.path().join("new.txt");
        std::fs::write(&new_path, b"hello").unwrap();
        let hash = sha1_hex(new_path.to_str().unwrap()).unwrap();

        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_file_hash(old_path.to_str().unwrap(), &hash)
            .await
            .unwrap();
        store
            .upsert_node_mapping(&NodeMapping {
                local_path: old_path.to_string_lossy().into_owned(),
                node_uid: "node-1".into(),
                parent_node_uid: "root".into(),
                is_directory: false,
                updated_at: 0,
            })
            .await
            .unwrap();

        let sync_dir = SyncDir {
            source_path: dir.path().to_string_lossy().into_owned(),
            remote_root: "backups".into(),
        };
        let rename_batch = vec![
            change(old_path.to_str().unwrap(), false, false, false, 0, 0),
            change(new_path.to_str().unwrap(), true, true, false, 100, 5),
        ];
        let rename_ids = classify_and_persist(&store, &sync_dir, &rename_batch, 1_000)
            .await
            .unwrap();
        assert_eq!(rename_ids.len(), 1);

        std::fs::write(&new_path, b"hello, world").unwrap();
        let update_batch = vec![change(new_path.to_str().unwrap(), true, false, false, 200, 12)];
        let update_ids = classify_and_persist(&store, &sync_dir, &update_batch, 1_000)
            .await
            .unwrap();

        assert_eq!(update_ids.len(), 1);
        assert_ne!(update_ids[0], rename_ids[0]);

        let rename_job = store.get_job(rename_ids[0]).await.unwrap().unwrap();
        assert_eq!(rename_job.event_type, EventType::Rename);
        let update_job = store.get_job(update_ids[0]).await.unwrap().unwrap();
        assert_eq!(update_job.event_type, EventType::Update);
        assert_eq!(update_job.local_path, new_path.to_string_lossy());
    }
}
