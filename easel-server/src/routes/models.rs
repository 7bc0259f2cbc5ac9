//! Catalog endpoints: listing, rescans, preview bytes.

use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use easel_core::{ErrorKind, ModelKind};

use crate::error::ApiError;
use crate::schemas::{ModelView, ModelsListResponse, ModelsQuery, ScanResponse, SeenOnView};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/scan", post(scan_models))
        .route("/models/{id}", get(get_model))
        .route("/models/{id}/preview", get(model_preview))
}

#[utoipa::path(
    get,
    path = "/api/v1/models",
    tag = "models",
    params(ModelsQuery),
    responses(
        (status = 200, description = "Catalog listed", body = ModelsListResponse),
        (status = 400, description = "Invalid type filter"),
    )
)]
pub async fn list_models(
    State(state): State<AppState>,
    Query(q): Query<ModelsQuery>,
) -> Result<Json<ModelsListResponse>, ApiError> {
    let kind = q.r#type.as_deref().map(ModelKind::from_str).transpose()?;
    let models = state.catalog.list(kind).await?;
    Ok(Json(ModelsListResponse {
        count: models.len(),
        models: models.into_iter().map(ModelView::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/models/{id}",
    tag = "models",
    params(("id" = i64, Path, description = "Catalog entry id")),
    responses(
        (status = 200, description = "Entry retrieved", body = ModelView),
        (status = 404, description = "Unknown entry"),
    )
)]
pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ModelView>, ApiError> {
    let entry = state
        .catalog
        .get(id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::CatalogEntryNotFound, format!("model {id} not found")))?;
    let seen = state.catalog.seen_on(id).await?;

    let mut view = ModelView::from(entry);
    view.seen_on_backends = Some(
        seen.into_iter()
            .map(|(backend_alias, last_seen_at)| SeenOnView {
                backend_alias,
                last_seen_at,
            })
            .collect(),
    );
    Ok(Json(view))
}

#[utoipa::path(
    post,
    path = "/api/v1/models/scan",
    tag = "models",
    responses(
        (status = 200, description = "Scan finished", body = ScanResponse),
        (status = 400, description = "No model root configured"),
    )
)]
pub async fn scan_models(State(state): State<AppState>) -> Result<Json<ScanResponse>, ApiError> {
    let root = state.config.model_root.clone().ok_or_else(|| {
        ApiError::new(
            ErrorKind::MissingRequiredField,
            "no model root configured; set EASEL_MODEL_ROOT",
        )
    })?;
    info!(root = %root.display(), "catalog rescan requested");
    let stats = state.catalog.scan(&root).await?;
    Ok(Json(ScanResponse {
        success: true,
        stats: stats.into(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/models/{id}/preview",
    tag = "models",
    params(("id" = i64, Path, description = "Catalog entry id")),
    responses(
        (status = 200, description = "Preview image bytes"),
        (status = 404, description = "Unknown entry or no preview"),
    )
)]
pub async fn model_preview(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = state
        .catalog
        .get(id)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::CatalogEntryNotFound, format!("model {id} not found")))?;
    let path = entry.preview_path.ok_or_else(|| {
        ApiError::new(
            ErrorKind::CatalogEntryNotFound,
            format!("model {id} has no preview image"),
        )
    })?;

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        ApiError::new(
            ErrorKind::CatalogEntryNotFound,
            format!("preview unreadable: {e}"),
        )
    })?;
    let mime = if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "image/png"
    };
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}
