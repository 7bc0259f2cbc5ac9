//! API-key admission gate.
//!
//! Disabled unless `EASEL_REQUIRE_API_KEY` is set; when enabled, every
//! `/api` request must carry a valid `X-API-Key` header.  The verified
//! key id is stashed as a request extension so admission can record it,
//! and `last_used_at` is updated off the request path.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

/// Request extension carrying the verified credential's key id.
#[derive(Debug, Clone)]
pub struct ApiKeyRef(pub String);

pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if !state.config.require_api_key {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let Some(key) = provided else {
        return ApiError::unauthorized().into_response();
    };

    match state.credentials.verify(&key).await {
        Ok(Some(cred)) => {
            let credentials = state.credentials.clone();
            let key_id = cred.key_id.clone();
            tokio::spawn(async move {
                if let Err(e) = credentials.touch_last_used(&key_id).await {
                    tracing::debug!(error = %e, "last_used_at update failed");
                }
            });
            req.extensions_mut().insert(ApiKeyRef(cred.key_id));
            next.run(req).await
        }
        Ok(None) => ApiError::unauthorized().into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}
