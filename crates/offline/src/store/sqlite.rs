//! SQLite-backed job store.
//!
//! One database file holds three tables: `jobs`, `job_attachments` and `kv_entries`.
//! Timestamps are stored as fixed-width RFC 3339 text; `seq` breaks ties between jobs
//! created in the same instant so listings stay FIFO.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldqueue_core::{AttachmentId, Job, JobFilter, JobId, JobKind, JobStatus, MediaAttachment};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{
    CacheEntry, CacheStore, Evicted, JobStore, JobUsage, Namespace, Usage, entry_size,
    payload_size, timestamp,
};
use crate::error::StoreError;

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
        id              TEXT NOT NULL UNIQUE,
        kind            TEXT NOT NULL,
        payload         TEXT NOT NULL,
        payload_size    INTEGER NOT NULL,
        status          TEXT NOT NULL,
        attempts        INTEGER NOT NULL,
        last_error      TEXT NULL,
        next_attempt_at TEXT NULL,
        created_at      TEXT NOT NULL,
        synced_at       TEXT NULL,
        remote_id       TEXT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created_at)"#,
    r#"
    CREATE TABLE IF NOT EXISTS job_attachments (
        id          TEXT PRIMARY KEY,
        job_id      TEXT NOT NULL,
        file_name   TEXT NOT NULL,
        mime_type   TEXT NOT NULL,
        data        BLOB NOT NULL,
        size_bytes  INTEGER NOT NULL,
        created_at  TEXT NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_job_attachments_job ON job_attachments (job_id)"#,
    r#"
    CREATE TABLE IF NOT EXISTS kv_entries (
        namespace   TEXT NOT NULL,
        key         TEXT NOT NULL,
        value       TEXT NOT NULL,
        size_bytes  INTEGER NOT NULL,
        updated_at  TEXT NOT NULL,
        PRIMARY KEY (namespace, key)
    )
    "#,
];

const JOB_COLUMNS: &str = "id, kind, payload, status, attempts, last_error, next_attempt_at, \
                           created_at, synced_at, remote_id";

/// SQLite-backed store. Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Self::connect(path).await.map_err(StoreError::from)
    }

    /// Private database that lives as long as the store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        async {
            // Every connection to `:memory:` is a separate database; keep exactly one.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .context("failed to open in-memory SQLite database")?;
            Self::migrate(pool).await
        }
        .await
        .map_err(StoreError::from)
    }

    async fn connect(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create job store directory at {parent:?}"))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to create SQLite pool for job store at {path:?}"))?;

        tracing::debug!(path = %path.display(), "job store opened");
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> anyhow::Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("failed to create job store schema")?;
        }
        Ok(Self { pool })
    }

    async fn insert_inner(&self, job: &Job, attachments: &[MediaAttachment]) -> anyhow::Result<()> {
        let (payload, size) = payload_size(job)?;
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, payload, payload_size, status, attempts, last_error,
                next_attempt_at, created_at, synced_at, remote_id
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.kind.as_str())
        .bind(payload)
        .bind(size as i64)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.last_error.as_deref())
        .bind(job.next_attempt_at.map(timestamp))
        .bind(timestamp(job.created_at))
        .bind(job.synced_at.map(timestamp))
        .bind(job.remote_id.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                anyhow::Error::new(StoreError::Duplicate(job.id))
            }
            _ => anyhow::Error::new(err).context(format!("failed to insert job {}", job.id)),
        })?;

        for attachment in attachments {
            sqlx::query(
                r#"
                INSERT INTO job_attachments (id, job_id, file_name, mime_type, data, size_bytes, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(attachment.id.to_string())
            .bind(job.id.to_string())
            .bind(&attachment.file_name)
            .bind(&attachment.mime_type)
            .bind(&attachment.data)
            .bind(attachment.data.len() as i64)
            .bind(timestamp(attachment.created_at))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert attachment for job {}", job.id))?;
        }

        tx.commit().await.context("failed to commit job insert")?;
        Ok(())
    }

    async fn get_jobs_inner(&self, filter: JobFilter) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR (status = 'synced') = ?3)
            ORDER BY created_at ASC, seq ASC
            "#
        ))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.synced)
        .fetch_all(&self.pool)
        .await
        .context("failed to list jobs")?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn update_inner(&self, job: &Job) -> anyhow::Result<()> {
        let (payload, size) = payload_size(job)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET payload = ?2,
                payload_size = ?3,
                status = ?4,
                attempts = ?5,
                last_error = ?6,
                next_attempt_at = ?7,
                synced_at = ?8,
                remote_id = ?9
            WHERE id = ?1
            "#,
        )
        .bind(job.id.to_string())
        .bind(payload)
        .bind(size as i64)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.last_error.as_deref())
        .bind(job.next_attempt_at.map(timestamp))
        .bind(job.synced_at.map(timestamp))
        .bind(job.remote_id.as_deref())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update job {}", job.id))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id).into());
        }
        Ok(())
    }

    async fn remove_inner(&self, id: JobId) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        sqlx::query("DELETE FROM job_attachments WHERE job_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("failed to delete job attachments")?;

        let removed = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("failed to delete job")?
            .rows_affected()
            > 0;

        tx.commit().await.context("failed to commit job removal")?;
        Ok(removed)
    }

    async fn usage_inner(&self) -> anyhow::Result<JobUsage> {
        let jobs = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS items,
                COALESCE(SUM(payload_size), 0) AS bytes,
                COALESCE(SUM(CASE WHEN status != 'synced' THEN 1 ELSE 0 END), 0) AS pending_items,
                COALESCE(SUM(CASE WHEN status != 'synced' THEN payload_size ELSE 0 END), 0) AS pending_bytes
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to measure jobs")?;

        let attachments = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS items,
                COALESCE(SUM(a.size_bytes), 0) AS bytes,
                COALESCE(SUM(CASE WHEN j.status = 'synced' THEN 1 ELSE 0 END), 0) AS synced_items,
                COALESCE(SUM(CASE WHEN j.status = 'synced' THEN a.size_bytes ELSE 0 END), 0) AS synced_bytes
            FROM job_attachments a
            LEFT JOIN jobs j ON j.id = a.job_id
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to measure attachments")?;

        Ok(JobUsage {
            records: usage(&jobs, "items", "bytes")?,
            pending_records: usage(&jobs, "pending_items", "pending_bytes")?,
            attachments: usage(&attachments, "items", "bytes")?,
            synced_attachments: usage(&attachments, "synced_items", "synced_bytes")?,
        })
    }

    async fn evict_attachments_inner(&self, exclude: &HashSet<JobId>) -> anyhow::Result<Evicted> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.job_id, a.size_bytes
            FROM job_attachments a
            JOIN jobs j ON j.id = a.job_id
            WHERE j.status = 'synced'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list synced attachments")?;

        let mut evicted = Evicted::default();
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        for row in rows {
            let job_id = parse_job_id(&row.try_get::<String, _>("job_id")?)?;
            if exclude.contains(&job_id) {
                continue;
            }
            let id: String = row.try_get("id")?;
            let size: i64 = row.try_get("size_bytes")?;

            // Re-checked at delete time: the owning job must still be synced.
            let deleted = sqlx::query(
                r#"
                DELETE FROM job_attachments
                WHERE id = ?1
                  AND job_id IN (SELECT id FROM jobs WHERE status = 'synced')
                "#,
            )
            .bind(&id)
            .execute(&mut *tx)
            .await
            .context("failed to evict attachment")?
            .rows_affected();

            if deleted > 0 {
                evicted.items += 1;
                evicted.bytes += size.max(0) as u64;
            }
        }

        tx.commit().await.context("failed to commit attachment eviction")?;
        Ok(evicted)
    }

    async fn purge_jobs_inner(
        &self,
        older_than: DateTime<Utc>,
        exclude: &HashSet<JobId>,
    ) -> anyhow::Result<Evicted> {
        let rows = sqlx::query(
            r#"
            SELECT id, payload_size
            FROM jobs
            WHERE status = 'synced'
              AND synced_at IS NOT NULL
              AND synced_at < ?1
            "#,
        )
        .bind(timestamp(older_than))
        .fetch_all(&self.pool)
        .await
        .context("failed to list synced jobs")?;

        let mut evicted = Evicted::default();
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        for row in rows {
            let id_str: String = row.try_get("id")?;
            if exclude.contains(&parse_job_id(&id_str)?) {
                continue;
            }
            let payload_bytes: i64 = row.try_get("payload_size")?;

            let attachment_bytes: i64 = sqlx::query(
                "SELECT COALESCE(SUM(size_bytes), 0) AS bytes FROM job_attachments WHERE job_id = ?1",
            )
            .bind(&id_str)
            .fetch_one(&mut *tx)
            .await
            .context("failed to measure job attachments")?
            .try_get("bytes")?;

            let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?1 AND status = 'synced'")
                .bind(&id_str)
                .execute(&mut *tx)
                .await
                .context("failed to purge synced job")?
                .rows_affected();
            if deleted == 0 {
                continue;
            }

            let attachments = sqlx::query("DELETE FROM job_attachments WHERE job_id = ?1")
                .bind(&id_str)
                .execute(&mut *tx)
                .await
                .context("failed to purge job attachments")?
                .rows_affected();

            evicted.items += 1 + attachments;
            evicted.bytes += (payload_bytes + attachment_bytes).max(0) as u64;
        }

        tx.commit().await.context("failed to commit job purge")?;
        Ok(evicted)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: Job, attachments: Vec<MediaAttachment>) -> Result<(), StoreError> {
        self.insert_inner(&job, &attachments).await?;
        tracing::debug!(job_id = %job.id, kind = %job.kind, attachments = attachments.len(), "job persisted");
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to load job")?;

        Ok(row.map(row_to_job).transpose()?)
    }

    async fn get_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        Ok(self.get_jobs_inner(filter).await?)
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE status != 'synced'")
            .fetch_one(&self.pool)
            .await
            .context("failed to count pending jobs")?
            .try_get("n")
            .context("failed to read pending count")?;

        Ok(count.max(0) as usize)
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        Ok(self.update_inner(job).await?)
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.remove_inner(id).await?)
    }

    async fn attachments(&self, job_id: JobId) -> Result<Vec<MediaAttachment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, file_name, mime_type, data, size_bytes, created_at
            FROM job_attachments
            WHERE job_id = ?1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to list attachments")?;

        Ok(rows
            .into_iter()
            .map(row_to_attachment)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn usage(&self) -> Result<JobUsage, StoreError> {
        Ok(self.usage_inner().await?)
    }

    async fn evict_synced_attachments(
        &self,
        exclude: &HashSet<JobId>,
    ) -> Result<Evicted, StoreError> {
        Ok(self.evict_attachments_inner(exclude).await?)
    }

    async fn purge_synced_jobs(
        &self,
        older_than: DateTime<Utc>,
        exclude: &HashSet<JobId>,
    ) -> Result<Evicted, StoreError> {
        Ok(self.purge_jobs_inner(older_than, exclude).await?)
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn put_at(
        &self,
        ns: Namespace,
        key: &str,
        value: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (namespace, key, value, size_bytes, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                size_bytes = excluded.size_bytes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(ns.as_str())
        .bind(key)
        .bind(value.to_string())
        .bind(entry_size(key, value) as i64)
        .bind(timestamp(at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write {} entry {key}", ns.as_str()))?;

        Ok(())
    }

    async fn get(
        &self,
        ns: Namespace,
        key: &str,
        max_age: Option<chrono::Duration>,
    ) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT key, value, updated_at FROM kv_entries WHERE namespace = ?1 AND key = ?2",
        )
        .bind(ns.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read {} entry {key}", ns.as_str()))?;

        let Some(entry) = row.map(row_to_entry).transpose()? else {
            return Ok(None);
        };

        if let Some(max_age) = max_age {
            if Utc::now() - entry.updated_at > max_age {
                return Ok(None);
            }
        }
        Ok(Some(entry.value))
    }

    async fn list(&self, ns: Namespace, prefix: &str) -> Result<Vec<CacheEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, value, updated_at
            FROM kv_entries
            WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
            ORDER BY updated_at ASC, key ASC
            "#,
        )
        .bind(ns.as_str())
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list {} entries", ns.as_str()))?;

        Ok(rows
            .into_iter()
            .map(row_to_entry)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn remove(&self, ns: Namespace, key: &str) -> Result<bool, StoreError> {
        let removed = sqlx::query("DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2")
            .bind(ns.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove {} entry {key}", ns.as_str()))?
            .rows_affected();

        Ok(removed > 0)
    }

    async fn evict_older_than(
        &self,
        ns: Namespace,
        prefix: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Evicted, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        let stale = sqlx::query(
            r#"
            SELECT COUNT(*) AS items, COALESCE(SUM(size_bytes), 0) AS bytes
            FROM kv_entries
            WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2 AND updated_at < ?3
            "#,
        )
        .bind(ns.as_str())
        .bind(prefix)
        .bind(timestamp(cutoff))
        .fetch_one(&mut *tx)
        .await
        .context("failed to measure stale entries")?;
        let evicted = usage(&stale, "items", "bytes")?;

        sqlx::query(
            r#"
            DELETE FROM kv_entries
            WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2 AND updated_at < ?3
            "#,
        )
        .bind(ns.as_str())
        .bind(prefix)
        .bind(timestamp(cutoff))
        .execute(&mut *tx)
        .await
        .context("failed to evict stale entries")?;

        tx.commit().await.context("failed to commit eviction")?;
        Ok(evicted)
    }

    async fn usage_in(&self, ns: Namespace) -> Result<Usage, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS items, COALESCE(SUM(size_bytes), 0) AS bytes
            FROM kv_entries
            WHERE namespace = ?1
            "#,
        )
        .bind(ns.as_str())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to measure {} entries", ns.as_str()))?;

        Ok(usage(&row, "items", "bytes")?)
    }
}

fn usage(row: &SqliteRow, items: &str, bytes: &str) -> anyhow::Result<Usage> {
    let items: i64 = row.try_get(items)?;
    let bytes: i64 = row.try_get(bytes)?;
    Ok(Usage {
        items: items.max(0) as u64,
        bytes: bytes.max(0) as u64,
    })
}

fn corrupt(msg: String) -> anyhow::Error {
    StoreError::Corrupt(msg).into()
}

fn parse_job_id(s: &str) -> anyhow::Result<JobId> {
    s.parse::<JobId>()
        .map_err(|e| corrupt(format!("invalid job id '{s}': {e}")))
}

fn parse_time(s: &str, column: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("invalid {column} '{s}': {e}")))
}

fn parse_optional_time(s: Option<String>, column: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_time(&s, column)).transpose()
}

/// Map a database row into a `Job`.
fn row_to_job(row: SqliteRow) -> anyhow::Result<Job> {
    let id = parse_job_id(&row.try_get::<String, _>("id")?)?;

    let kind_str: String = row.try_get("kind")?;
    let kind = kind_str
        .parse::<JobKind>()
        .map_err(|e| corrupt(format!("job {id}: {e}")))?;

    let payload_str: String = row.try_get("payload")?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| corrupt(format!("invalid JSON payload for job {id}: {e}")))?;

    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|e| corrupt(format!("job {id}: {e}")))?;

    let attempts: i64 = row.try_get("attempts")?;
    let created_at = parse_time(&row.try_get::<String, _>("created_at")?, "created_at")?;

    Ok(Job {
        id,
        kind,
        payload,
        created_at,
        status,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        next_attempt_at: parse_optional_time(row.try_get("next_attempt_at")?, "next_attempt_at")?,
        synced_at: parse_optional_time(row.try_get("synced_at")?, "synced_at")?,
        remote_id: row.try_get("remote_id")?,
    })
}

fn row_to_attachment(row: SqliteRow) -> anyhow::Result<MediaAttachment> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<AttachmentId>()
        .map_err(|e| corrupt(format!("invalid attachment id '{id_str}': {e}")))?;
    let size: i64 = row.try_get("size_bytes")?;

    Ok(MediaAttachment {
        id,
        job_id: parse_job_id(&row.try_get::<String, _>("job_id")?)?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        data: row.try_get("data")?,
        size: size.max(0) as u64,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?, "created_at")?,
    })
}

fn row_to_entry(row: SqliteRow) -> anyhow::Result<CacheEntry> {
    let key: String = row.try_get("key")?;
    let value_str: String = row.try_get("value")?;
    let value = serde_json::from_str(&value_str)
        .map_err(|e| corrupt(format!("invalid JSON in entry {key}: {e}")))?;
    let updated_at = parse_time(&row.try_get::<String, _>("updated_at")?, "updated_at")?;

    Ok(CacheEntry::new(key, value, updated_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldqueue_core::{ApprovalSubmission, JobPayload, NewAttachment, WorkSubmission};
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::open_in_memory().await.unwrap()
    }

    fn work(action: u64) -> JobPayload {
        WorkSubmission::new("0xgarden", action, "Planting")
            .with_plants(vec!["tomato".into()], Some(3))
            .into()
    }

    fn photo(bytes: usize) -> NewAttachment {
        NewAttachment::new("photo.jpg", "image/jpeg", vec![7; bytes])
    }

    #[tokio::test]
    async fn job_and_attachments_round_trip() {
        let store = store().await;
        let id = store.add_job(work(1), vec![photo(64)]).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::Work);
        assert_eq!(job.payload, work(1));
        assert_eq!(job.status, JobStatus::Pending);

        let attachments = store.attachments(id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].data, vec![7; 64]);
        assert_eq!(attachments[0].size, 64);
    }

    #[tokio::test]
    async fn updated_job_reads_back_identically() {
        let store = store().await;
        let id = store.add_job(work(1), Vec::new()).await.unwrap();

        let mut job = store.record_failure(id, "connection reset").await.unwrap();
        job.schedule_retry(&fieldqueue_core::RetryPolicy::default(), Utc::now());
        store.update(&job).await.unwrap();

        assert_eq!(store.get_job(id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn listings_are_fifo_and_filtered() {
        let store = store().await;
        let at = Utc::now();
        let first = Job::created_at(work(1), at);
        let second = Job::created_at(work(2), at);
        let approval = Job::created_at(ApprovalSubmission::new("0xgarden", "w1", 1, true).into(), at);
        let ids = [first.id, second.id, approval.id];
        for job in [first, second, approval] {
            store.insert(job, Vec::new()).await.unwrap();
        }

        let all: Vec<_> = store.get_jobs(JobFilter::all()).await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(all, ids);

        let works = store.get_jobs(JobFilter::all().with_kind(JobKind::Work)).await.unwrap();
        assert_eq!(works.len(), 2);

        store.mark_synced(ids[0], Some("0xabc".into())).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 2);
        assert_eq!(store.get_jobs(JobFilter::unsynced()).await.unwrap().len(), 2);
        assert_eq!(store.get_jobs(JobFilter::all().with_synced(true)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inserting_an_existing_id_is_a_duplicate() {
        let store = store().await;
        let job = Job::new(work(1));
        store.insert(job.clone(), vec![]).await.unwrap();

        let err = store.insert(job.clone(), vec![]).await.unwrap_err();

        assert_eq!(err, StoreError::Duplicate(job.id));
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_of_unknown_job_is_not_found() {
        let store = store().await;
        let job = Job::new(work(1));
        assert_eq!(store.update(&job).await, Err(StoreError::NotFound(job.id)));
    }

    #[tokio::test]
    async fn remove_deletes_attachments() {
        let store = store().await;
        let id = store.add_job(work(1), vec![photo(10), photo(20)]).await.unwrap();

        assert!(store.remove_job(id).await.unwrap());
        assert!(!store.remove_job(id).await.unwrap());
        assert!(store.attachments(id).await.unwrap().is_empty());
        assert_eq!(store.usage().await.unwrap().attachments, Usage::default());
    }

    #[tokio::test]
    async fn eviction_only_touches_synced_jobs() {
        let store = store().await;
        let pending = store.add_job(work(1), vec![photo(100)]).await.unwrap();
        let synced = store.add_job(work(2), vec![photo(50)]).await.unwrap();
        let excluded = store.add_job(work(3), vec![photo(25)]).await.unwrap();
        store.mark_synced(synced, None).await.unwrap();
        store.mark_synced(excluded, None).await.unwrap();

        let usage = store.usage().await.unwrap();
        assert_eq!(usage.attachments.bytes, 175);
        assert_eq!(usage.synced_attachments.bytes, 75);

        let evicted = store
            .evict_synced_attachments(&HashSet::from([excluded]))
            .await
            .unwrap();
        assert_eq!(evicted, Usage { items: 1, bytes: 50 });
        assert_eq!(store.attachments(pending).await.unwrap().len(), 1);
        assert_eq!(store.attachments(excluded).await.unwrap().len(), 1);

        let purged = store
            .purge_synced_jobs(Utc::now() + chrono::Duration::seconds(1), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(purged.items, 3);
        assert!(store.get_job(pending).await.unwrap().is_some());
        assert!(store.get_job(synced).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_bytes_match_measured_usage() {
        let store = store().await;
        let id = store.add_job(work(1), vec![photo(40)]).await.unwrap();
        store.mark_synced(id, None).await.unwrap();

        let before = store.usage().await.unwrap();
        let purged = store
            .purge_synced_jobs(Utc::now() + chrono::Duration::seconds(1), &HashSet::new())
            .await
            .unwrap();
        let after = store.usage().await.unwrap();

        let total = |u: JobUsage| u.records.bytes + u.attachments.bytes;
        assert_eq!(total(before) - total(after), purged.bytes);
        assert_eq!(total(after), 0);
    }

    #[tokio::test]
    async fn kv_entries_expire_and_evict_by_prefix() {
        let store = store().await;
        let old = Utc::now() - chrono::Duration::days(10);
        store
            .put_at(Namespace::Cache, "garden/0x1", &json!({"name": "North"}), old)
            .await
            .unwrap();
        store
            .put(Namespace::Cache, "garden/0x2", &json!({"name": "South"}))
            .await
            .unwrap();
        store
            .put_at(Namespace::Metadata, "usage_sample/a", &json!({"used": 1}), old)
            .await
            .unwrap();

        assert_eq!(
            store
                .get(Namespace::Cache, "garden/0x1", Some(chrono::Duration::days(7)))
                .await
                .unwrap(),
            None
        );
        assert!(store.get(Namespace::Cache, "garden/0x1", None).await.unwrap().is_some());
        assert_eq!(store.list(Namespace::Cache, "garden/").await.unwrap().len(), 2);

        let before = store.usage_in(Namespace::Cache).await.unwrap();
        let evicted = store
            .evict_older_than(Namespace::Cache, "", Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        let after = store.usage_in(Namespace::Cache).await.unwrap();

        assert_eq!(evicted.items, 1);
        assert_eq!(before.bytes - after.bytes, evicted.bytes);
        assert_eq!(store.usage_in(Namespace::Metadata).await.unwrap().items, 1);
        assert!(store.remove(Namespace::Metadata, "usage_sample/a").await.unwrap());
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_jobs() {
        let path = std::env::temp_dir()
            .join(format!("fieldqueue-test-{}", JobId::new()))
            .join("queue.db");

        let id = {
            let store = SqliteStore::open(&path).await.unwrap();
            let id = store.add_job(work(1), Vec::new()).await.unwrap();
            store.pool.close().await;
            id
        };

        let store = SqliteStore::open(&path).await.unwrap();
        assert!(store.get_job(id).await.unwrap().is_some());

        store.pool.close().await;
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
