//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - CORS (wildcard by default, restricted via `EASEL_CORS_ORIGINS`)
//! - `/health`
//! - `/ws` push gateway
//! - `/api/v1` and `/api/v2` (thin adapters over one admission op),
//!   optionally behind the API-key gate
//! - the OpenAPI document at `/api-docs/openapi.json`

pub mod backends;
pub mod health;
pub mod jobs;
pub mod models;
pub mod v1;
pub mod v2;
pub mod ws;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::middleware::require_api_key;
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: AppState) -> Router {
    // Wildcard is the development default; set EASEL_CORS_ORIGINS in
    // production.
    let cors = if let Some(origins_str) = &state.config.cors_allowed_origins {
        let origins: Vec<axum::http::HeaderValue> = origins_str
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
        } else {
            CorsLayer::new()
                .allow_origin(origins)
                .allow_headers(Any)
                .allow_methods(Any)
        }
    } else {
        CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
    };

    let api = Router::new()
        .nest("/api/v1", v1::router())
        .nest("/api/v2", v2::router())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .merge(health::router())
        .route("/ws", get(ws::ws_handler))
        .route("/api-docs/openapi.json", get(crate::doc::serve_openapi))
        .merge(api)
        .layer(cors)
        .with_state(state)
}
