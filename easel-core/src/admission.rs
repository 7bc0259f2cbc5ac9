//! Admission: validate a submission, resolve its backend, normalize the
//! checkpoint reference, and insert the job.
//!
//! Both HTTP API versions funnel into [`admit`]; the versioned routes are
//! thin adapters over it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CoreError;
use crate::job::AppType;
use crate::queue::{NewJob, QueueStore};
use crate::registry::RegistryStore;

/// A validated submission, as assembled by the HTTP adapters.  The
/// credential gate runs before this point; `api_key_ref` is whatever it
/// established.
#[derive(Debug, Clone)]
pub struct Submission {
    pub target_backend: String,
    pub generation_params: serde_json::Value,
    pub app_type: AppType,
    pub source_info: Option<String>,
    pub api_key_ref: Option<String>,
}

/// What the caller gets back from a successful admission.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReceipt {
    pub job_id: String,
    /// 1-based position among pending jobs for this backend.
    pub queue_position: i64,
    pub created_at: DateTime<Utc>,
    pub target_backend: String,
    pub app_type: AppType,
}

/// Admit a submission.  No job is created when any step fails.
pub async fn admit(
    queue: &QueueStore,
    registry: &RegistryStore,
    submission: Submission,
) -> Result<AdmissionReceipt, CoreError> {
    let backend = registry
        .get(&submission.target_backend)
        .await?
        .ok_or_else(|| CoreError::BackendNotFound(submission.target_backend.clone()))?;

    let params = normalize_params(submission.app_type, submission.generation_params)?;

    let job = queue
        .insert(NewJob {
            target_backend: backend.alias,
            app_type: submission.app_type,
            source_info: submission.source_info,
            api_key_ref: submission.api_key_ref,
            generation_params: params,
        })
        .await?;

    let queue_position = queue.pending_position(&job.id).await?.unwrap_or(1);
    tracing::info!(
        job_id = %job.id,
        backend = %job.target_backend,
        queue_position,
        "job admitted"
    );
    Ok(AdmissionReceipt {
        job_id: job.id,
        queue_position,
        created_at: job.created_at,
        target_backend: job.target_backend,
        app_type: job.app_type,
    })
}

/// Dialect-specific parameter normalization.
///
/// For `forge`: a checkpoint reference is required, either as
/// `checkpoint_name` or the legacy `sd_checkpoint` (which is copied into
/// the canonical key when it is the only one present); path separators
/// are normalized to forward slashes.
fn normalize_params(
    app_type: AppType,
    mut params: serde_json::Value,
) -> Result<serde_json::Value, CoreError> {
    let AppType::Forge = app_type;

    let obj = params.as_object_mut().ok_or_else(|| {
        CoreError::InvalidFieldValue("generation_params must be a JSON object".to_owned())
    })?;

    let canonical = obj
        .get("checkpoint_name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned);
    let legacy = obj
        .get("sd_checkpoint")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned);

    let name = canonical
        .or(legacy)
        .ok_or(CoreError::MissingRequiredField("checkpoint_name"))?;
    obj.insert(
        "checkpoint_name".to_owned(),
        serde_json::Value::String(name.replace('\\', "/")),
    );

    Ok(params)
}
