//! v2 (extended) request/response shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Extended submission carrying the protocol dialect and origin tag.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(as = GenerateRequestV2)]
pub struct GenerateRequest {
    pub target_backend: String,
    #[schema(value_type = Object)]
    pub generation_params: serde_json::Value,
    /// Backend dialect; defaults to `forge`.
    pub app_type: Option<String>,
    pub source_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[schema(as = GenerateResponseV2)]
pub struct GenerateResponse {
    pub job_id: String,
    pub queue_position: i64,
    pub created_at: DateTime<Utc>,
    pub app_type: String,
    pub target_backend: String,
}
