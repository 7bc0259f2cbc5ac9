//! Durable job queue: the sole source of truth for job state.
//!
//! All state-changing operations are guarded by a status precondition in
//! the `WHERE` clause; when the precondition does not hold the operation
//! returns a typed [`CoreError::InvalidTransition`] and mutates nothing.
//! Every status transition publishes a [`QueueEvent::JobChanged`] snapshot
//! on the bus.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::bus::{EventBus, QueueEvent};
use crate::db::{ensure_column, now_str, open_pool, parse_ts, ts_str};
use crate::error::CoreError;
use crate::job::{AppType, Job, JobResult, JobStatus};

const JOB_COLUMNS: &str = "id, status, target_backend, backend_session, app_type, source_info, \
     api_key_ref, generation_params, result_images, result_info, error_kind, error_message, \
     progress_percent, preview_filename, current_step, total_steps, retry_count, \
     created_at, updated_at, completed_at";

/// Parameters for a new job, produced by the admission layer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub target_backend: String,
    pub app_type: AppType,
    pub source_info: Option<String>,
    pub api_key_ref: Option<String>,
    pub generation_params: serde_json::Value,
}

/// Sort direction for [`QueueStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filters for [`QueueStore::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub app_type: Option<AppType>,
    pub limit: Option<i64>,
    pub offset: i64,
    pub order: SortOrder,
}

/// SQLite-backed queue store.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    bus: EventBus,
}

impl QueueStore {
    /// Open (or create) the queue database at `path` and run the additive
    /// migration step.
    pub async fn open(path: &Path, bus: EventBus) -> Result<Self, CoreError> {
        let pool = open_pool(path).await?;
        migrate(&pool).await?;
        Ok(Self { pool, bus })
    }

    /// Insert a new `pending` job and publish its first snapshot.
    pub async fn insert(&self, new: NewJob) -> Result<Job, CoreError> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let params = new.generation_params.to_string();

        sqlx::query(
            "INSERT INTO jobs (id, status, target_backend, app_type, source_info, api_key_ref, \
             generation_params, retry_count, created_at, updated_at) \
             VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
        )
        .bind(&id)
        .bind(&new.target_backend)
        .bind(new.app_type.as_str())
        .bind(&new.source_info)
        .bind(&new.api_key_ref)
        .bind(&params)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let job = self.fetch_required(&id).await?;
        self.bus.publish(QueueEvent::JobChanged { job: job.clone() });
        Ok(job)
    }

    /// Atomically claim the oldest `pending` job for `alias`, flipping it
    /// to `processing`.
    ///
    /// The selection and the flip are one statement, so concurrent
    /// claimers for the same alias can never both receive the same job.
    /// Ordering: `created_at`, then lexicographic `id`.
    pub async fn claim_next_for_backend(&self, alias: &str) -> Result<Option<Job>, CoreError> {
        let now = now_str();
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'processing', updated_at = ?1 \
             WHERE id = (SELECT id FROM jobs WHERE status = 'pending' AND target_backend = ?2 \
                         ORDER BY created_at ASC, id ASC LIMIT 1) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&now)
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let job: Job = row.try_into()?;
                self.bus.publish(QueueEvent::JobChanged { job: job.clone() });
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Record the backend's session handle.  Allowed once, while
    /// `processing`, when no session has been assigned yet.
    pub async fn set_backend_session(&self, job_id: &str, session: &str) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE jobs SET backend_session = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'processing' AND backend_session IS NULL",
        )
        .bind(session)
        .bind(now_str())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "assign a backend session").await);
        }
        Ok(())
    }

    /// Persist normalized generation parameters (canonical checkpoint
    /// path).  Allowed only while `processing`.
    pub async fn set_generation_params(
        &self,
        job_id: &str,
        params: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE jobs SET generation_params = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(params.to_string())
        .bind(now_str())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "update generation params").await);
        }
        Ok(())
    }

    /// Merge the latest progress snapshot into the job.  Allowed only
    /// while `processing`.
    pub async fn update_progress(
        &self,
        job_id: &str,
        percent: f64,
        preview_filename: Option<&str>,
        current_step: i64,
        total_steps: i64,
    ) -> Result<(), CoreError> {
        let res = sqlx::query(
            "UPDATE jobs SET progress_percent = ?1, \
             preview_filename = COALESCE(?2, preview_filename), \
             current_step = ?3, total_steps = ?4, updated_at = ?5 \
             WHERE id = ?6 AND status = 'processing'",
        )
        .bind(percent)
        .bind(preview_filename)
        .bind(current_step)
        .bind(total_steps)
        .bind(now_str())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "record progress").await);
        }
        Ok(())
    }

    /// Bump `updated_at` without touching anything else (used when a
    /// monitor suspends during shutdown).  A no-op on terminal jobs.
    pub async fn touch(&self, job_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2 AND status = 'processing'")
            .bind(now_str())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminally complete a `processing` job.
    pub async fn complete(
        &self,
        job_id: &str,
        filenames: &[String],
        info: &serde_json::Value,
    ) -> Result<Job, CoreError> {
        let now = now_str();
        let files = serde_json::to_string(filenames).unwrap_or_else(|_| "[]".to_owned());
        let res = sqlx::query(
            "UPDATE jobs SET status = 'completed', result_images = ?1, result_info = ?2, \
             progress_percent = 100.0, completed_at = ?3, updated_at = ?3 \
             WHERE id = ?4 AND status = 'processing'",
        )
        .bind(&files)
        .bind(info.to_string())
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "complete").await);
        }
        let job = self.fetch_required(job_id).await?;
        self.bus.publish(QueueEvent::JobChanged { job: job.clone() });
        Ok(job)
    }

    /// Fail a `pending` or `processing` job.
    ///
    /// With `retryable = true` the job instead stays `pending` with
    /// `retry_count` incremented; whether to do so is the caller's policy
    /// decision, never the store's.
    pub async fn fail(
        &self,
        job_id: &str,
        error_kind: &str,
        message: &str,
        retryable: bool,
    ) -> Result<Job, CoreError> {
        let now = now_str();
        let res = if retryable {
            sqlx::query(
                "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1, \
                 error_kind = ?1, error_message = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status IN ('pending', 'processing')",
            )
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', error_kind = ?1, error_message = ?2, \
                 completed_at = ?3, updated_at = ?3 \
                 WHERE id = ?4 AND status IN ('pending', 'processing')",
            )
        }
        .bind(error_kind)
        .bind(message)
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "fail").await);
        }
        let job = self.fetch_required(job_id).await?;
        self.bus.publish(QueueEvent::JobChanged { job: job.clone() });
        Ok(job)
    }

    /// Cancel a `pending` or `processing` job.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, CoreError> {
        let now = now_str();
        let res = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status IN ('pending', 'processing')",
        )
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "cancel").await);
        }
        let job = self.fetch_required(job_id).await?;
        self.bus.publish(QueueEvent::JobChanged { job: job.clone() });
        Ok(job)
    }

    /// Retrieve a single job.
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>, CoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Job::try_from).transpose()
    }

    /// List jobs with optional filters.  Returns `(total, page)` where
    /// `total` counts all jobs matching the filters.
    pub async fn list(&self, filter: &JobFilter) -> Result<(i64, Vec<Job>), CoreError> {
        let mut conds: Vec<&str> = Vec::new();
        if filter.status.is_some() {
            conds.push("status = ?");
        }
        if filter.app_type.is_some() {
            conds.push("app_type = ?");
        }
        let where_sql = if conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conds.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs{where_sql}");
        let mut count_q = sqlx::query_as::<_, (i64,)>(&count_sql);
        if let Some(s) = filter.status {
            count_q = count_q.bind(s.as_str());
        }
        if let Some(a) = filter.app_type {
            count_q = count_q.bind(a.as_str());
        }
        let (total,) = count_q.fetch_one(&self.pool).await?;

        let dir = filter.order.as_sql();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs{where_sql} \
             ORDER BY created_at {dir}, id {dir} LIMIT ? OFFSET ?"
        );
        let mut q = sqlx::query_as::<_, JobRow>(&sql);
        if let Some(s) = filter.status {
            q = q.bind(s.as_str());
        }
        if let Some(a) = filter.app_type {
            q = q.bind(a.as_str());
        }
        let rows = q
            .bind(filter.limit.unwrap_or(50))
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((total, jobs))
    }

    /// Administratively delete a terminal job.
    pub async fn delete(&self, job_id: &str) -> Result<(), CoreError> {
        let res = sqlx::query(
            "DELETE FROM jobs WHERE id = ?1 AND status IN ('completed', 'failed', 'cancelled')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(self.transition_error(job_id, "delete").await);
        }
        Ok(())
    }

    /// All `processing` jobs.  Meaningful at startup, before any monitor
    /// exists: every returned job is an orphan to be reconciled.
    pub async fn list_orphaned_processing(&self) -> Result<Vec<Job>, CoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing' \
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// The oldest `processing` job for `alias`, if any.
    pub async fn get_processing_for_backend(&self, alias: &str) -> Result<Option<Job>, CoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing' AND target_backend = ?1 \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        ))
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Job::try_from).transpose()
    }

    /// `pending` jobs created at or before `cutoff` (the dispatcher's
    /// unknown-backend sweep).
    pub async fn list_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Job>, CoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' AND created_at <= ?1 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(ts_str(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// All non-terminal jobs, oldest first (the push gateway's `hello`
    /// snapshot).
    pub async fn snapshot_non_terminal(&self) -> Result<Vec<Job>, CoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status IN ('pending', 'processing') \
             ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    /// 1-based position of a `pending` job among pending jobs for its
    /// backend, ordered by `created_at` then `id`.  `None` when the job is
    /// not pending.
    pub async fn pending_position(&self, job_id: &str) -> Result<Option<i64>, CoreError> {
        let job = match self.get(job_id).await? {
            Some(j) if j.status == JobStatus::Pending => j,
            _ => return Ok(None),
        };
        let created = ts_str(job.created_at);
        let (ahead,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE status = 'pending' AND target_backend = ?1 \
             AND (created_at < ?2 OR (created_at = ?2 AND id < ?3))",
        )
        .bind(&job.target_backend)
        .bind(&created)
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(ahead + 1))
    }

    async fn fetch_required(&self, job_id: &str) -> Result<Job, CoreError> {
        self.get(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_owned()))
    }

    /// Build the typed error for a failed status precondition.
    async fn transition_error(&self, job_id: &str, action: &'static str) -> CoreError {
        match self.get(job_id).await {
            Ok(Some(job)) => CoreError::InvalidTransition {
                job_id: job_id.to_owned(),
                from: job.status,
                action,
            },
            Ok(None) => CoreError::JobNotFound(job_id.to_owned()),
            Err(e) => e,
        }
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            target_backend TEXT NOT NULL,
            backend_session TEXT,
            app_type TEXT NOT NULL DEFAULT 'forge',
            generation_params TEXT NOT NULL,
            result_images TEXT,
            result_info TEXT,
            error_kind TEXT,
            error_message TEXT,
            progress_percent REAL,
            preview_filename TEXT,
            current_step INTEGER,
            total_steps INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )",
    )
    .execute(pool)
    .await?;

    // Added after the first schema revision.
    ensure_column(pool, "jobs", "source_info", "source_info TEXT").await?;
    ensure_column(pool, "jobs", "api_key_ref", "api_key_ref TEXT").await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim \
         ON jobs (status, target_backend, created_at, id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs (created_at)")
        .execute(pool)
        .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: String,
    target_backend: String,
    backend_session: Option<String>,
    app_type: String,
    source_info: Option<String>,
    api_key_ref: Option<String>,
    generation_params: String,
    result_images: Option<String>,
    result_info: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    progress_percent: Option<f64>,
    preview_filename: Option<String>,
    current_step: Option<i64>,
    total_steps: Option<i64>,
    retry_count: i64,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let params = serde_json::from_str(&row.generation_params).unwrap_or_else(|e| {
            tracing::warn!(job_id = %row.id, error = %e, "corrupt generation_params; using null");
            serde_json::Value::Null
        });
        let filenames = row.result_images.as_deref().map(|raw| {
            serde_json::from_str(raw).unwrap_or_else(|e| {
                tracing::warn!(job_id = %row.id, error = %e, "corrupt result_images; using empty");
                Vec::new()
            })
        });
        let info = row
            .result_info
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        Ok(Job {
            status: row.status.parse()?,
            app_type: row.app_type.parse()?,
            target_backend: row.target_backend,
            backend_session: row.backend_session,
            source_info: row.source_info,
            api_key_ref: row.api_key_ref,
            generation_params: params,
            result: JobResult {
                filenames,
                info,
                error_kind: row.error_kind,
                error_message: row.error_message,
                progress_percent: row.progress_percent,
                preview_filename: row.preview_filename,
                current_step: row.current_step,
                total_steps: row.total_steps,
            },
            retry_count: row.retry_count,
            created_at: parse_ts(&row.created_at),
            updated_at: parse_ts(&row.updated_at),
            completed_at: row.completed_at.as_deref().map(parse_ts),
            id: row.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (QueueStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = QueueStore::open(&dir.path().join("queue.db"), bus)
            .await
            .unwrap();
        (store, dir)
    }

    fn new_job(alias: &str) -> NewJob {
        NewJob {
            target_backend: alias.to_owned(),
            app_type: AppType::Forge,
            source_info: Some("test".to_owned()),
            api_key_ref: None,
            generation_params: serde_json::json!({"prompt": "x", "checkpoint_name": "m.safetensors"}),
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.completed_at.is_none());

        let got = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(got.generation_params["prompt"], "x");
        assert_eq!(got.target_backend, "a");
    }

    #[tokio::test]
    async fn claim_follows_insertion_order() {
        let (store, _dir) = store().await;
        let j1 = store.insert(new_job("a")).await.unwrap();
        let j2 = store.insert(new_job("a")).await.unwrap();
        store.insert(new_job("b")).await.unwrap();

        let first = store.claim_next_for_backend("a").await.unwrap().unwrap();
        assert_eq!(first.id, j1.id);
        assert_eq!(first.status, JobStatus::Processing);

        let second = store.claim_next_for_backend("a").await.unwrap().unwrap();
        assert_eq!(second.id, j2.id);

        assert!(store.claim_next_for_backend("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_hand_out_the_same_job() {
        let (store, _dir) = store().await;
        store.insert(new_job("a")).await.unwrap();
        store.insert(new_job("a")).await.unwrap();

        let (s1, s2) = (store.clone(), store.clone());
        let (a, b) = tokio::join!(
            tokio::spawn(async move { s1.claim_next_for_backend("a").await.unwrap() }),
            tokio::spawn(async move { s2.claim_next_for_backend("a").await.unwrap() }),
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn complete_requires_processing() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();

        let err = store
            .complete(&job.id, &["f.png".to_owned()], &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition { from: JobStatus::Pending, .. }
        ));

        // Nothing was mutated.
        let got = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(got.status, JobStatus::Pending);
        assert!(got.result.filenames.is_none());
    }

    #[tokio::test]
    async fn terminal_jobs_reject_further_transitions() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();
        store.claim_next_for_backend("a").await.unwrap().unwrap();
        let done = store
            .complete(&job.id, &["x_000.png".to_owned()], &serde_json::json!({"seed": 0}))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let completed_at = done.completed_at.expect("terminal sets completed_at");
        assert!(completed_at >= done.created_at);

        for err in [
            store.cancel(&job.id).await.unwrap_err(),
            store.fail(&job.id, "backend_transport", "late", false).await.unwrap_err(),
            store.update_progress(&job.id, 10.0, None, 1, 2).await.unwrap_err(),
        ] {
            assert!(matches!(err, CoreError::InvalidTransition { .. }));
        }

        // completed_at untouched by the rejected attempts.
        let got = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(got.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn retryable_failure_keeps_pending_and_counts() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();
        store.claim_next_for_backend("a").await.unwrap().unwrap();

        let back = store
            .fail(&job.id, "backend_transport", "connect refused", true)
            .await
            .unwrap();
        assert_eq!(back.status, JobStatus::Pending);
        assert_eq!(back.retry_count, 1);
        assert!(back.completed_at.is_none());
        assert_eq!(back.result.error_message.as_deref(), Some("connect refused"));
    }

    #[tokio::test]
    async fn session_is_assigned_at_most_once() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();
        store.claim_next_for_backend("a").await.unwrap().unwrap();

        store.set_backend_session(&job.id, "s-1").await.unwrap();
        let err = store.set_backend_session(&job.id, "s-2").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let got = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(got.backend_session.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn delete_only_terminal() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();

        let err = store.delete(&job.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        store.cancel(&job.id).await.unwrap();
        store.delete(&job.id).await.unwrap();
        assert!(store.get(&job.id).await.unwrap().is_none());

        let err = store.delete(&job.id).await.unwrap_err();
        assert!(matches!(err, CoreError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn updated_at_is_non_decreasing() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();
        let mut last = job.updated_at;

        store.claim_next_for_backend("a").await.unwrap().unwrap();
        for pct in [10.0, 20.0, 30.0] {
            store.update_progress(&job.id, pct, None, 1, 3).await.unwrap();
            let got = store.get(&job.id).await.unwrap().unwrap();
            assert!(got.updated_at >= last);
            last = got.updated_at;
        }
    }

    #[tokio::test]
    async fn list_filters_and_orders() {
        let (store, _dir) = store().await;
        let j1 = store.insert(new_job("a")).await.unwrap();
        let j2 = store.insert(new_job("a")).await.unwrap();
        store.claim_next_for_backend("a").await.unwrap().unwrap();

        let (total, all) = store.list(&JobFilter::default()).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);
        // Default order is newest first.
        assert_eq!(all[0].id, j2.id);

        let (total, pending) = store
            .list(&JobFilter {
                status: Some(JobStatus::Pending),
                order: SortOrder::Asc,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(pending[0].id, j2.id);

        let (_, page) = store
            .list(&JobFilter {
                limit: Some(1),
                offset: 1,
                order: SortOrder::Asc,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, j2.id);
        let _ = j1;
    }

    #[tokio::test]
    async fn pending_position_is_per_backend_fifo() {
        let (store, _dir) = store().await;
        let j1 = store.insert(new_job("a")).await.unwrap();
        let j2 = store.insert(new_job("a")).await.unwrap();
        let other = store.insert(new_job("b")).await.unwrap();

        assert_eq!(store.pending_position(&j1.id).await.unwrap(), Some(1));
        assert_eq!(store.pending_position(&j2.id).await.unwrap(), Some(2));
        assert_eq!(store.pending_position(&other.id).await.unwrap(), Some(1));

        store.claim_next_for_backend("a").await.unwrap().unwrap();
        assert_eq!(store.pending_position(&j1.id).await.unwrap(), None);
        assert_eq!(store.pending_position(&j2.id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn transitions_publish_job_changed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let store = QueueStore::open(&dir.path().join("queue.db"), bus)
            .await
            .unwrap();

        let job = store.insert(new_job("a")).await.unwrap();
        store.claim_next_for_backend("a").await.unwrap().unwrap();
        store
            .complete(&job.id, &[], &serde_json::json!({}))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match sub.recv().await.unwrap() {
                QueueEvent::JobChanged { job } => seen.push(job.status),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn orphan_listing_sees_processing_jobs() {
        let (store, _dir) = store().await;
        let job = store.insert(new_job("a")).await.unwrap();
        assert!(store.list_orphaned_processing().await.unwrap().is_empty());

        store.claim_next_for_backend("a").await.unwrap().unwrap();
        let orphans = store.list_orphaned_processing().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, job.id);

        let by_alias = store.get_processing_for_backend("a").await.unwrap();
        assert_eq!(by_alias.unwrap().id, job.id);
        assert!(store
            .get_processing_for_backend("b")
            .await
            .unwrap()
            .is_none());
    }
}
