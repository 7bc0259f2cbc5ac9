//! easel-server: HTTP + WebSocket surface over [`easel_core`].
//!
//! Exposed as a library so the integration tests can build the router
//! against scratch stores; the binary entry point lives in `main.rs`.

pub mod config;
pub mod doc;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod schemas;
pub mod state;

pub use config::Config;
pub use error::ApiError;
pub use routes::build as build_app;
pub use state::AppState;
