use pds_core::types::{EventType, FileHash, FileState, JobState, NodeMapping, Signal, SyncJob};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unknown event type in row: {0}")]
    BadEventType(String),
    #[error("unknown job state in row: {0}")]
    BadJobState(String),
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Embedded transactional store backing the sync engine (C1).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if absent) the SQLite database at `path` and run
    /// pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Io(std::io::Error::other(format!(
                    "creating state dir {}: {e}",
                    parent.display()
                )))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    // ── Startup recovery (§4.1) ─────────────────────────────────────────

    /// Reset every `PROCESSING` row to `PENDING` with `retry_at = now`.
    /// Called once at engine startup, before the Watcher/Processor start.
    pub async fn startup_recovery(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET state = 'PENDING', retry_at = ? WHERE state = 'PROCESSING'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Job queue (C4) ──────────────────────────────────────────────────

    /// Persist a new PENDING job. Coalescing against an existing row is the
    /// Classifier's responsibility (§4.3); this is a raw insert.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_job(
        &self,
        event_type: EventType,
        local_path: &str,
        remote_path: &str,
        old_local_path: Option<&str>,
        old_remote_path: Option<&str>,
        content_hash: Option<&str>,
    ) -> Result<i64> {
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO sync_jobs
                (event_type, local_path, remote_path, old_local_path, old_remote_path,
                 content_hash, state, n_retries, retry_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'PENDING', 0, ?, ?)",
        )
        .bind(event_type.to_string())
        .bind(local_path)
        .bind(remote_path)
        .bind(old_local_path)
        .bind(old_remote_path)
        .bind(content_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Find the sole non-SYNCED job for `local_path`, for the Classifier's
    /// coalescing rule (§4.3 step 4).
    pub async fn active_job_for_path(&self, local_path: &str) -> Result<Option<SyncJob>> {
        let row = sqlx::query(
            "SELECT * FROM sync_jobs WHERE local_path = ? AND state != 'SYNCED'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_job).transpose()
    }

    /// Overwrite a job's mutable fields in place (coalescing target).
    pub async fn update_job_fields(
        &self,
        id: i64,
        event_type: EventType,
        remote_path: &str,
        old_local_path: Option<&str>,
        old_remote_path: Option<&str>,
        content_hash: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET event_type = ?, remote_path = ?, old_local_path = ?,
             old_remote_path = ?, content_hash = ? WHERE id = ?",
        )
        .bind(event_type.to_string())
        .bind(remote_path)
        .bind(old_local_path)
        .bind(old_remote_path)
        .bind(content_hash)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// "Claim a job" (§4.1): atomically select the oldest ready PENDING row,
    /// mark it PROCESSING, and return it.
    pub async fn claim_job(&self) -> Result<Option<SyncJob>> {
        let mut tx = self.pool.begin().await?;
        let now = now_ms();

        let row = sqlx::query(
            "SELECT id FROM sync_jobs WHERE state = 'PENDING' AND retry_at <= ?
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let id: i64 = row.get("id");

        sqlx::query("UPDATE sync_jobs SET state = 'PROCESSING' WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let job_row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row_to_job(job_row)?))
    }

    /// "Complete a job" for CREATE/UPDATE/RENAME/MOVE (§4.1): mark SYNCED
    /// and upsert NodeMapping + FileHash + FileState in one transaction.
    pub async fn complete_job_upsert(
        &self,
        job_id: i64,
        mapping: &NodeMapping,
        hash: Option<&FileHash>,
        state: &FileState,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = now_ms();

        sqlx::query("UPDATE sync_jobs SET state = 'SYNCED' WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO node_mapping (local_path, node_uid, parent_node_uid, is_directory, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(local_path) DO UPDATE SET
               node_uid = excluded.node_uid,
               parent_node_uid = excluded.parent_node_uid,
               is_directory = excluded.is_directory,
               updated_at = excluded.updated_at",
        )
        .bind(&mapping.local_path)
        .bind(&mapping.node_uid)
        .bind(&mapping.parent_node_uid)
        .bind(mapping.is_directory)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if let Some(hash) = hash {
            sqlx::query(
                "INSERT INTO file_hashes (local_path, content_hash, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(local_path) DO UPDATE SET
                   content_hash = excluded.content_hash, updated_at = excluded.updated_at",
            )
            .bind(&hash.local_path)
            .bind(&hash.content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO file_state (local_path, change_token, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(local_path) DO UPDATE SET
               change_token = excluded.change_token, updated_at = excluded.updated_at",
        )
        .bind(&state.local_path)
        .bind(&state.change_token)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// "Complete a job" for DELETE (§4.1, §4.5): mark SYNCED and remove
    /// NodeMapping + FileHash + FileState for `local_path`.
    pub async fn complete_job_delete(&self, job_id: i64, local_path: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE sync_jobs SET state = 'SYNCED' WHERE id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM node_mapping WHERE local_path = ?")
            .bind(local_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_hashes WHERE local_path = ?")
            .bind(local_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_state WHERE local_path = ?")
            .bind(local_path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// "Fail a job" (§4.1): record the error, and either re-queue with a
    /// backoff delay or mark the job BLOCKED. The retry-vs-block decision
    /// itself is the Processor's (pds-engine's) responsibility; this method
    /// just executes whichever transition it picked.
    pub async fn schedule_retry(&self, job_id: i64, retry_at_ms: i64, last_error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET state = 'PENDING', n_retries = n_retries + 1,
             retry_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(retry_at_ms)
        .bind(last_error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// REUPLOAD_NEEDED jobs convert to DELETE_AND_CREATE once `nRetries >= 2`
    /// (§4.4). The old/new path fields are already populated identically
    /// (`old_local_path = local_path`) since a reupload never moves the
    /// file; only the event kind and remote target for the delete leg
    /// change.
    pub async fn convert_to_delete_and_create(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE sync_jobs SET event_type = 'DELETE_AND_CREATE',
             old_local_path = local_path, old_remote_path = remote_path
             WHERE id = ?",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_blocked(&self, job_id: i64, last_error: &str) -> Result<()> {
        sqlx::query("UPDATE sync_jobs SET state = 'BLOCKED', last_error = ? WHERE id = ?")
            .bind(last_error)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// "Directory-prefix rename" (§4.1): rewrite every FileHash/NodeMapping/
    /// FileState row whose `local_path` begins with `old_dir + "/"`.
    pub async fn rename_prefix(&self, old_dir: &str, new_dir: &str) -> Result<u64> {
        let old_prefix = format!("{old_dir}/");
        let new_prefix = format!("{new_dir}/");
        let like_pattern = format!("{}%", escape_like(&old_prefix));

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for table in ["file_hashes", "file_state", "node_mapping"] {
            let query = format!(
                "UPDATE {table} SET local_path = ? || substr(local_path, ?)
                 WHERE local_path LIKE ? ESCAPE '\\'"
            );
            let result = sqlx::query(&query)
                .bind(&new_prefix)
                .bind(old_prefix.len() as i64 + 1)
                .bind(&like_pattern)
                .execute(&mut *tx)
                .await?;
            affected += result.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    // ── Signal queue ─────────────────────────────────────────────────────

    pub async fn send_signal(&self, tag: Signal) -> Result<()> {
        sqlx::query("INSERT INTO signals (tag, created_at) VALUES (?, ?)")
            .bind(tag.to_string())
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drain the signal queue in FIFO order (at-most-one-consumer per tag:
    /// once drained, the rows are gone).
    pub async fn receive_signals(&self) -> Result<Vec<Signal>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT tag FROM signals ORDER BY id ASC")
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM signals").execute(&mut *tx).await?;
        tx.commit().await?;

        rows.into_iter()
            .map(|r| {
                let tag: String = r.get("tag");
                Signal::parse(&tag).ok_or(Error::BadJobState(tag))
            })
            .collect()
    }

    // ── FileState / FileHash / NodeMapping accessors ────────────────────

    pub async fn get_file_state(&self, local_path: &str) -> Result<Option<FileState>> {
        let row = sqlx::query("SELECT * FROM file_state WHERE local_path = ?")
            .bind(local_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_file_state))
    }

    pub async fn upsert_file_state(&self, local_path: &str, change_token: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_state (local_path, change_token, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(local_path) DO UPDATE SET
               change_token = excluded.change_token, updated_at = excluded.updated_at",
        )
        .bind(local_path)
        .bind(change_token)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_file_state(&self, local_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM file_state WHERE local_path = ?")
            .bind(local_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_file_hash(&self, local_path: &str) -> Result<Option<FileHash>> {
        let row = sqlx::query("SELECT * FROM file_hashes WHERE local_path = ?")
            .bind(local_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_file_hash))
    }

    pub async fn get_node_mapping(&self, local_path: &str) -> Result<Option<NodeMapping>> {
        let row = sqlx::query("SELECT * FROM node_mapping WHERE local_path = ?")
            .bind(local_path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(row_to_node_mapping))
    }

    /// All `FileState` rows whose `local_path` falls under `prefix`, used to
    /// build the Watcher's scan-diff token map for one sync root (§4.2).
    pub async fn file_states_with_prefix(&self, prefix: &str) -> Result<Vec<FileState>> {
        let like_pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query("SELECT * FROM file_state WHERE local_path LIKE ? ESCAPE '\\'")
            .bind(like_pattern)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(row_to_file_state).collect())
    }

    /// Direct FileHash upsert, bypassing the job-completion transaction.
    /// Used by the Processor to record ancestor-folder mappings that are
    /// materialized outside of any single job, and by test fixtures that
    /// need to seed prior sync state.
    pub async fn upsert_file_hash(&self, local_path: &str, content_hash: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO file_hashes (local_path, content_hash, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(local_path) DO UPDATE SET
               content_hash = excluded.content_hash, updated_at = excluded.updated_at",
        )
        .bind(local_path)
        .bind(content_hash)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Direct NodeMapping upsert; see [`Store::upsert_file_hash`].
    pub async fn upsert_node_mapping(&self, mapping: &NodeMapping) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_mapping (local_path, node_uid, parent_node_uid, is_directory, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(local_path) DO UPDATE SET
               node_uid = excluded.node_uid,
               parent_node_uid = excluded.parent_node_uid,
               is_directory = excluded.is_directory,
               updated_at = excluded.updated_at",
        )
        .bind(&mapping.local_path)
        .bind(&mapping.node_uid)
        .bind(&mapping.parent_node_uid)
        .bind(mapping.is_directory)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn job_count(&self, state: JobState) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM sync_jobs WHERE state = ?")
            .bind(state.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("c"))
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// `pds reset` (§6): `signals_only` drains just the signal queue;
    /// `retry_timers_only` zeroes the backoff state on PENDING/BLOCKED jobs
    /// without touching mappings or hashes; otherwise every table is
    /// truncated, returning the store to its just-migrated state.
    pub async fn reset(&self, signals_only: bool, retry_timers_only: bool) -> Result<()> {
        if signals_only {
            sqlx::query("DELETE FROM signals").execute(&self.pool).await?;
            return Ok(());
        }
        if retry_timers_only {
            sqlx::query(
                "UPDATE sync_jobs SET n_retries = 0, retry_at = ?, last_error = NULL, state = 'PENDING'
                 WHERE state IN ('PENDING', 'BLOCKED')",
            )
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for table in ["sync_jobs", "signals", "file_hashes", "file_state", "node_mapping"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` prefix match.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<SyncJob> {
    let event_type: String = row.get("event_type");
    let state: String = row.get("state");
    Ok(SyncJob {
        id: row.get("id"),
        event_type: EventType::parse(&event_type).ok_or(Error::BadEventType(event_type))?,
        local_path: row.get("local_path"),
        remote_path: row.get("remote_path"),
        old_local_path: row.get("old_local_path"),
        old_remote_path: row.get("old_remote_path"),
        content_hash: row.get("content_hash"),
        state: JobState::parse(&state).ok_or(Error::BadJobState(state))?,
        n_retries: row.get("n_retries"),
        retry_at: row.get("retry_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    })
}

fn row_to_file_state(row: sqlx::sqlite::SqliteRow) -> FileState {
    FileState {
        local_path: row.get("local_path"),
        change_token: row.get("change_token"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_file_hash(row: sqlx::sqlite::SqliteRow) -> FileHash {
    FileHash {
        local_path: row.get("local_path"),
        content_hash: row.get("content_hash"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_node_mapping(row: sqlx::sqlite::SqliteRow) -> NodeMapping {
    NodeMapping {
        local_path: row.get("local_path"),
        node_uid: row.get("node_uid"),
        parent_node_uid: row.get("parent_node_uid"),
        is_directory: row.get("is_directory"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn claim_job_returns_none_when_empty() {
        let s = store().await;
        assert!(s.claim_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_then_claim_marks_processing() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();

        let job = s.claim_job().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Processing);

        // Claimed job is no longer claimable.
        assert!(s.claim_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_recovery_resets_processing_to_pending() {
        let s = store().await;
        s.enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        let job = s.claim_job().await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);

        let recovered = s.startup_recovery().await.unwrap();
        assert_eq!(recovered, 1);

        let job = s.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn complete_job_upsert_persists_all_three_rows() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.claim_job().await.unwrap();

        let mapping = NodeMapping {
            local_path: "/a.txt".into(),
            node_uid: "node-1".into(),
            parent_node_uid: "root".into(),
            is_directory: false,
            updated_at: 0,
        };
        let hash = FileHash {
            local_path: "/a.txt".into(),
            content_hash: "abc123".into(),
            updated_at: 0,
        };
        let state = FileState {
            local_path: "/a.txt".into(),
            change_token: "1000:5".into(),
            updated_at: 0,
        };

        s.complete_job_upsert(id, &mapping, Some(&hash), &state)
            .await
            .unwrap();

        let job = s.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Synced);
        assert_eq!(
            s.get_node_mapping("/a.txt").await.unwrap().unwrap().node_uid,
            "node-1"
        );
        assert_eq!(
            s.get_file_hash("/a.txt").await.unwrap().unwrap().content_hash,
            "abc123"
        );
        assert_eq!(
            s.get_file_state("/a.txt").await.unwrap().unwrap().change_token,
            "1000:5"
        );
    }

    #[tokio::test]
    async fn complete_job_delete_removes_all_three_rows() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        let mapping = NodeMapping {
            local_path: "/a.txt".into(),
            node_uid: "node-1".into(),
            parent_node_uid: "root".into(),
            is_directory: false,
            updated_at: 0,
        };
        s.complete_job_upsert(
            id,
            &mapping,
            Some(&FileHash {
                local_path: "/a.txt".into(),
                content_hash: "abc".into(),
                updated_at: 0,
            }),
            &FileState {
                local_path: "/a.txt".into(),
                change_token: "1:1".into(),
                updated_at: 0,
            },
        )
        .await
        .unwrap();

        let delete_id = s
            .enqueue_job(EventType::Delete, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.claim_job().await.unwrap();
        s.complete_job_delete(delete_id, "/a.txt").await.unwrap();

        assert!(s.get_node_mapping("/a.txt").await.unwrap().is_none());
        assert!(s.get_file_hash("/a.txt").await.unwrap().is_none());
        assert!(s.get_file_state("/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_job_schedules_retry_with_incremented_count() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.claim_job().await.unwrap();

        s.schedule_retry(id, now_ms() + 5000, "connection reset")
            .await
            .unwrap();

        let job = s.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.n_retries, 1);
        assert_eq!(job.last_error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn fail_job_can_mark_blocked() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.claim_job().await.unwrap();

        s.mark_blocked(id, "permanent failure").await.unwrap();

        let job = s.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Blocked);
    }

    #[tokio::test]
    async fn rename_prefix_rewrites_descendant_rows() {
        let s = store().await;
        for path in ["/dir/a.txt", "/dir/sub/b.txt"] {
            let mapping = NodeMapping {
                local_path: path.into(),
                node_uid: format!("node-{path}"),
                parent_node_uid: "root".into(),
                is_directory: false,
                updated_at: 0,
            };
            let id = s
                .enqueue_job(EventType::Create, path, "root", None, None, None)
                .await
                .unwrap();
            s.claim_job().await.unwrap();
            s.complete_job_upsert(
                id,
                &mapping,
                Some(&FileHash {
                    local_path: path.into(),
                    content_hash: "h".into(),
                    updated_at: 0,
                }),
                &FileState {
                    local_path: path.into(),
                    change_token: "1:1".into(),
                    updated_at: 0,
                },
            )
            .await
            .unwrap();
        }

        let affected = s.rename_prefix("/dir", "/renamed").await.unwrap();
        assert_eq!(affected, 6); // 2 paths * 3 tables

        assert!(s.get_node_mapping("/dir/a.txt").await.unwrap().is_none());
        assert_eq!(
            s.get_node_mapping("/renamed/a.txt")
                .await
                .unwrap()
                .unwrap()
                .node_uid,
            "node-/dir/a.txt"
        );
        assert_eq!(
            s.get_file_state("/renamed/sub/b.txt")
                .await
                .unwrap()
                .unwrap()
                .change_token,
            "1:1"
        );
    }

    #[tokio::test]
    async fn signals_are_fifo_and_drain_exactly_once() {
        let s = store().await;
        s.send_signal(Signal::Pause).await.unwrap();
        s.send_signal(Signal::Resume).await.unwrap();

        let signals = s.receive_signals().await.unwrap();
        assert_eq!(signals, vec![Signal::Pause, Signal::Resume]);
        assert!(s.receive_signals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_job_for_path_ignores_synced_rows() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        assert!(s.active_job_for_path("/a.txt").await.unwrap().is_some());

        s.claim_job().await.unwrap();
        s.complete_job_upsert(
            id,
            &NodeMapping {
                local_path: "/a.txt".into(),
                node_uid: "n".into(),
                parent_node_uid: "root".into(),
                is_directory: false,
                updated_at: 0,
            },
            None,
            &FileState {
                local_path: "/a.txt".into(),
                change_token: "1:1".into(),
                updated_at: 0,
            },
        )
        .await
        .unwrap();

        assert!(s.active_job_for_path("/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_signals_only_leaves_jobs_intact() {
        let s = store().await;
        s.enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.send_signal(Signal::Pause).await.unwrap();

        s.reset(true, false).await.unwrap();

        assert!(s.receive_signals().await.unwrap().is_empty());
        assert_eq!(s.job_count(JobState::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_retry_timers_only_clears_backoff_state() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.claim_job().await.unwrap();
        s.mark_blocked(id, "disk full").await.unwrap();

        s.reset(false, true).await.unwrap();

        let job = s.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.n_retries, 0);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn reset_everything_truncates_all_tables() {
        let s = store().await;
        let id = s
            .enqueue_job(EventType::Create, "/a.txt", "root/a.txt", None, None, None)
            .await
            .unwrap();
        s.claim_job().await.unwrap();
        s.complete_job_upsert(
            id,
            &NodeMapping {
                local_path: "/a.txt".into(),
                node_uid: "n".into(),
                parent_node_uid: "root".into(),
                is_directory: false,
                updated_at: 0,
            },
            Some(&FileHash {
                local_path: "/a.txt".into(),
                content_hash: "h".into(),
                updated_at: 0,
            }),
            &FileState {
                local_path: "/a.txt".into(),
                change_token: "1:1".into(),
                updated_at: 0,
            },
        )
        .await
        .unwrap();
        s.send_signal(Signal::Pause).await.unwrap();

        s.reset(false, false).await.unwrap();

        assert!(s.get_job(id).await.unwrap().is_none());
        assert!(s.get_node_mapping("/a.txt").await.unwrap().is_none());
        assert!(s.get_file_hash("/a.txt").await.unwrap().is_none());
        assert!(s.get_file_state("/a.txt").await.unwrap().is_none());
        assert!(s.receive_signals().await.unwrap().is_empty());
    }
}
