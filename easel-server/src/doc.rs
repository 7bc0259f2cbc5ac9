//! OpenAPI document, served at `/api-docs/openapi.json`.

use axum::Json;
use utoipa::OpenApi;

use crate::schemas;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "easel",
        description = "Job-queue front-end for Stable Diffusion inference backends"
    ),
    paths(
        crate::routes::health::health,
        crate::routes::v1::generate,
        crate::routes::v2::generate,
        crate::routes::jobs::list_jobs,
        crate::routes::jobs::get_job,
        crate::routes::jobs::job_status,
        crate::routes::jobs::cancel_job,
        crate::routes::jobs::delete_job,
        crate::routes::backends::list_backends,
        crate::routes::backends::create_backend,
        crate::routes::backends::update_backend,
        crate::routes::backends::delete_backend,
        crate::routes::models::list_models,
        crate::routes::models::get_model,
        crate::routes::models::scan_models,
        crate::routes::models::model_preview,
    ),
    components(schemas(
        schemas::HealthResponse,
        schemas::JobView,
        schemas::JobStatusView,
        schemas::JobsListResponse,
        schemas::CancelResponse,
        schemas::DeleteResponse,
        schemas::BackendView,
        schemas::BackendUpsertRequest,
        schemas::BackendsListResponse,
        schemas::ModelView,
        schemas::SeenOnView,
        schemas::ModelsListResponse,
        schemas::ScanStatsView,
        schemas::ScanResponse,
        schemas::v1::GenerateRequest,
        schemas::v1::GenerateResponse,
        schemas::v2::GenerateRequest,
        schemas::v2::GenerateResponse,
    )),
    tags(
        (name = "generate", description = "Job admission"),
        (name = "jobs", description = "Job lifecycle"),
        (name = "backends", description = "Backend registry"),
        (name = "models", description = "Local model catalog"),
        (name = "health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

pub async fn serve_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
