//! easel-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the three SQLite stores and run their migration steps.
//! 4. Start the dispatcher on its own task.
//! 5. Build the Axum router and serve with graceful shutdown.
//! 6. On shutdown, signal the dispatcher and wait for its monitors.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{info, warn};

use easel_core::{CatalogStore, Dispatcher, EventBus, QueueStore, RegistryStore};
use easel_server::{build_app, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: EASEL_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if cfg.production {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "easel-server starting");

    // ── 3. Stores ──────────────────────────────────────────────────────────────
    std::fs::create_dir_all(&cfg.storage_dir)?;
    std::fs::create_dir_all(&cfg.output_dir)?;

    let bus = EventBus::new();
    let queue = QueueStore::open(&cfg.storage_dir.join("queue.db"), bus.clone()).await?;
    let registry = RegistryStore::open(&cfg.storage_dir.join("registry.db")).await?;
    let credentials = registry.credentials();
    let catalog = CatalogStore::open(&cfg.storage_dir.join("catalog.db")).await?;
    info!(storage_dir = %cfg.storage_dir.display(), "stores ready");

    // Initial catalog scan in the background when a model root is set.
    if let Some(root) = cfg.model_root.clone() {
        let catalog = catalog.clone();
        tokio::spawn(async move {
            match catalog.scan(&root).await {
                Ok(stats) => info!(?stats, "startup catalog scan finished"),
                Err(e) => warn!(error = %e, "startup catalog scan failed"),
            }
        });
    }

    // ── 4. Dispatcher ──────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Dispatcher::new(
        queue.clone(),
        registry.clone(),
        catalog.clone(),
        bus.clone(),
        cfg.dispatcher_config(),
        shutdown_rx,
    );
    let cancels = dispatcher.cancels();
    let dispatcher_task = tokio::spawn(dispatcher.run());
    info!("dispatcher running");

    // ── 5. HTTP server with graceful shutdown ──────────────────────────────────
    let state = AppState {
        config: Arc::new(cfg.clone()),
        queue,
        registry,
        credentials,
        catalog,
        bus,
        cancels,
        started_at: Instant::now(),
    };
    let app = build_app(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 6. Drain the dispatcher ────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    dispatcher_task.await?;

    info!("easel-server stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
