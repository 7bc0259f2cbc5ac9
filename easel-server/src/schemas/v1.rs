//! v1 (legacy) request/response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Legacy submission: backend plus the raw generation payload.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(as = GenerateRequestV1)]
pub struct GenerateRequest {
    pub target_backend: String,
    #[schema(value_type = Object)]
    pub generation_params: serde_json::Value,
    pub source_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(as = GenerateResponseV1)]
pub struct GenerateResponse {
    pub job_id: String,
    pub queue_position: i64,
    pub created_at: DateTime<Utc>,
}
