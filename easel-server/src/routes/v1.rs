//! v1 API: the legacy submission shape plus jobs, backends, and models.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};

use easel_core::{AppType, Submission};

use crate::error::ApiError;
use crate::middleware::ApiKeyRef;
use crate::schemas::v1::{GenerateRequest, GenerateResponse};
use crate::state::AppState;

use super::{backends, jobs, models};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generate))
        .merge(jobs::router(true))
        .merge(backends::router())
        .merge(models::router())
}

#[utoipa::path(
    post,
    path = "/api/v1/generate",
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
    let receipt = easel_core::admit(
        &state.queue,
        &state.registry,
        Submission {
            target_backend: req.target_backend,
            generation_params: req.generation_params,
            app_type: AppType::Forge,
            source_info: req.source_info.or_else(|| Some("api_v1".to_owned())),
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
        }),
    ))
}
