//! Wire-facing request/response types, shared across API versions.

pub mod v1;
pub mod v2;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use easel_core::{Backend, CatalogEntry, Job, ScanStats};

/// One job as returned by every jobs endpoint and the push channel.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobView {
    pub job_id: String,
    #[schema(example = "pending")]
    pub status: String,
    pub target_backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_session: Option<String>,
    pub app_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_info: Option<String>,
    #[schema(value_type = Object)]
    pub generation_params: serde_json::Value,
    /// Progress snapshot while processing; filenames and info blob when
    /// completed; error kind and message when failed.
    #[schema(value_type = Object)]
    pub result: serde_json::Value,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let result = serde_json::to_value(&job.result).unwrap_or_default();
        Self {
            job_id: job.id,
            status: job.status.as_str().to_owned(),
            target_backend: job.target_backend,
            backend_session: job.backend_session,
            app_type: job.app_type.as_str().to_owned(),
            source_info: job.source_info,
            generation_params: job.generation_params,
            result,
            retry_count: job.retry_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// `GET /jobs/{id}/status`: the job plus derived scheduling fields.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobStatusView {
    #[serde(flatten)]
    pub job: JobView,
    /// 1-based position among pending jobs for the same backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    /// Seconds, derived from the steps-based estimate; only while
    /// processing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time_remaining: Option<u64>,
}

/// Filters accepted by the jobs listing.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub app_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// `asc` or `desc` (default) by creation time.
    pub order: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobsListResponse {
    pub total: i64,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CancelResponse {
    pub success: bool,
    pub job: JobView,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeleteResponse {
    pub success: bool,
    pub job_id: String,
}

// ── Backends ─────────────────────────────────────────────────────────────────

/// A registered backend, with credentials redacted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackendView {
    pub alias: String,
    pub base_url: String,
    pub has_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_root_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Backend> for BackendView {
    fn from(b: Backend) -> Self {
        Self {
            alias: b.alias,
            base_url: b.base_url,
            has_auth: b.auth.is_some(),
            model_root_path: b.model_root_path,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BackendUpsertRequest {
    /// Required on `POST /backends`; taken from the path on `PUT`.
    pub alias: Option<String>,
    pub base_url: String,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub model_root_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackendsListResponse {
    pub count: usize,
    pub backends: Vec<BackendView>,
}

// ── Models ───────────────────────────────────────────────────────────────────

/// One catalog entry.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelView {
    pub id: i64,
    pub kind: String,
    pub filename: String,
    pub local_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_autov2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    pub trained_words: Vec<String>,
    pub has_preview: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub metadata_status: String,
    pub metadata_source: String,
    /// Backends known to have this file; filled on single-entry reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seen_on_backends: Option<Vec<SeenOnView>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SeenOnView {
    pub backend_alias: String,
    pub last_seen_at: DateTime<Utc>,
}

impl From<CatalogEntry> for ModelView {
    fn from(e: CatalogEntry) -> Self {
        Self {
            id: e.id,
            kind: e.kind.as_str().to_owned(),
            filename: e.filename,
            local_dir: e.local_dir,
            hash_autov2: e.hash_autov2,
            hash_sha256: e.hash_sha256,
            model_id: e.model_id,
            version_id: e.version_id,
            display_name: e.display_name,
            base_model: e.base_model,
            trained_words: e.trained_words,
            has_preview: e.preview_path.is_some(),
            preview_url: e.preview_url,
            description: e.description,
            metadata_status: e.metadata_status.as_str().to_owned(),
            metadata_source: e.metadata_source.as_str().to_owned(),
            seen_on_backends: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelsListResponse {
    pub count: usize,
    pub models: Vec<ModelView>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct ModelsQuery {
    /// `checkpoint` or `lora`.
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScanStatsView {
    pub files_seen: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped_duplicates: u64,
    pub rejected: u64,
    pub errors: u64,
}

impl From<ScanStats> for ScanStatsView {
    fn from(s: ScanStats) -> Self {
        Self {
            files_seen: s.files_seen,
            inserted: s.inserted,
            updated: s.updated,
            skipped_duplicates: s.skipped_duplicates,
            rejected: s.rejected,
            errors: s.errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScanResponse {
    pub success: bool,
    pub stats: ScanStatsView,
}

// ── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}
