//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Instant;

use easel_core::{
    CancelRegistry, CatalogStore, CredentialStore, EventBus, QueueStore, RegistryStore,
};

use crate::config::Config;

/// State shared across all HTTP handlers and the push gateway.  All
/// stores are cheap pool clones; the composition root in `main` builds
/// exactly one of each.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: QueueStore,
    pub registry: RegistryStore,
    pub credentials: CredentialStore,
    pub catalog: CatalogStore,
    pub bus: EventBus,
    /// Cancellation signals for monitors owned by the dispatcher.
    pub cancels: CancelRegistry,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
