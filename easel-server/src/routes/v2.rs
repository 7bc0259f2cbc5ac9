//! v2 API: extended submission shape; job routes shared with v1.

use std::str::FromStr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};

use easel_core::{AppType, Submission};

use crate::error::ApiError;
use crate::middleware::ApiKeyRef;
use crate::schemas::v2::{GenerateRequest, GenerateResponse};
use crate::state::AppState;

use super::jobs;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generate))
        .merge(jobs::router(false))
}

#[utoipa::path(
    post,
    path = "/api/v2/generate",
    tag = "generate",
    request_body = GenerateRequest,
    responses(
        (status = 202, description = "Job admitted", body = GenerateResponse),
        (status = 400, description = "Invalid submission"),
        (status = 401, description = "Missing or invalid API key"),
        (status = 404, description = "Unknown backend"),
    )
)]
pub async fn generate(
    State(state): State<AppState>,
    api_key: Option<Extension<ApiKeyRef>>,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    let app_type = req
        .app_type
        .as_deref()
        .map(AppType::from_str)
        .transpose()?
        .unwrap_or_default();

    let receipt = easel_core::admit(
        &state.queue,
        &state.registry,
        Submission {
            target_backend: req.target_backend,
            generation_params: req.generation_params,
            app_type,
            source_info: req.source_info,
            api_key_ref: api_key.map(|Extension(k)| k.0),
        },
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            job_id: receipt.job_id,
            queue_position: receipt.queue_position,
            created_at: receipt.created_at,
            app_type: receipt.app_type.as_str().to_owned(),
            target_backend: receipt.target_backend,
        }),
    ))
}
