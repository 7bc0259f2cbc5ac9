//! Backend registry CRUD.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use tracing::info;

use easel_core::{BackendSpec, BasicAuth, ErrorKind};

use crate::error::ApiError;
use crate::schemas::{BackendUpsertRequest, BackendView, BackendsListResponse};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/backends", get(list_backends).post(create_backend))
        .route("/backends/{alias}", put(update_backend).delete(delete_backend))
}

#[utoipa::path(
    get,
    path = "/api/v1/backends",
    tag = "backends",
    responses((status = 200, description = "Backends listed", body = BackendsListResponse))
)]
pub async fn list_backends(
    State(state): State<AppState>,
) -> Result<Json<BackendsListResponse>, ApiError> {
    let backends = state.registry.list().await?;
    Ok(Json(BackendsListResponse {
        count: backends.len(),
        backends: backends.into_iter().map(BackendView::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/backends",
    tag = "backends",
    request_body = BackendUpsertRequest,
    responses(
        (status = 201, description = "Backend registered", body = BackendView),
        (status = 400, description = "Invalid backend definition"),
    )
)]
pub async fn create_backend(
    State(state): State<AppState>,
    Json(req): Json<BackendUpsertRequest>,
) -> Result<(StatusCode, Json<BackendView>), ApiError> {
    let alias = req
        .alias
        .clone()
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ApiError::new(ErrorKind::MissingRequiredField, "missing required field: alias"))?;
    let backend = upsert(&state, alias, req).await?;
    Ok((StatusCode::CREATED, Json(backend)))
}

#[utoipa::path(
    put,
    path = "/api/v1/backends/{alias}",
    tag = "backends",
    params(("alias" = String, Path, description = "Backend alias")),
    request_body = BackendUpsertRequest,
    responses(
        (status = 200, description = "Backend updated", body = BackendView),
        (status = 400, description = "Invalid backend definition"),
    )
)]
pub async fn update_backend(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Json(req): Json<BackendUpsertRequest>,
) -> Result<Json<BackendView>, ApiError> {
    if let Some(body_alias) = &req.alias {
        if body_alias != &alias {
            return Err(ApiError::bad_request(format!(
                "alias in body ('{body_alias}') does not match path ('{alias}')"
            )));
        }
    }
    let backend = upsert(&state, alias, req).await?;
    Ok(Json(backend))
}

#[utoipa::path(
    delete,
    path = "/api/v1/backends/{alias}",
    tag = "backends",
    params(("alias" = String, Path, description = "Backend alias")),
    responses(
        (status = 200, description = "Backend removed"),
        (status = 404, description = "Unknown alias"),
    )
)]
pub async fn delete_backend(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Pending jobs pinned to this alias surface as failures at dispatch
    // time, after the grace window.
    state.registry.delete(&alias).await?;
    info!(backend = %alias, "backend removed");
    Ok(Json(serde_json::json!({ "success": true, "alias": alias })))
}

async fn upsert(
    state: &AppState,
    alias: String,
    req: BackendUpsertRequest,
) -> Result<BackendView, ApiError> {
    if req.base_url.trim().is_empty() || !req.base_url.contains("://") {
        return Err(ApiError::bad_request(format!(
            "base_url must be an absolute URL, got '{}'",
            req.base_url
        )));
    }
    let auth = match (req.auth_username, req.auth_password) {
        (Some(username), Some(password)) => Some(BasicAuth { username, password }),
        (None, None) => None,
        _ => {
            return Err(ApiError::bad_request(
                "auth_username and auth_password must be provided together",
            ))
        }
    };
    let model_root_path = req
        .model_root_path
        .or_else(|| state.config.model_path_hint(&alias));

    let backend = state
        .registry
        .upsert(BackendSpec {
            alias: alias.clone(),
            base_url: req.base_url,
            auth,
            model_root_path,
        })
        .await?;
    info!(backend = %alias, base_url = %backend.base_url, "backend registered");
    Ok(backend.into())
}
