//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use easel_core::DispatcherConfig;

/// Runtime configuration for easel-server.
///
/// Every field has a default so the server works out-of-the-box without
/// any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:9191"`).
    pub bind_address: String,

    /// Directory holding the three SQLite files (queue, catalog,
    /// registry+credentials).  Default: `./data`.
    pub storage_dir: PathBuf,

    /// Directory where generated images and previews are written.
    /// Default: `./output`.
    pub output_dir: PathBuf,

    /// Root of the local model tree scanned into the catalog.  Scanning
    /// is rejected when unset.
    pub model_root: Option<PathBuf>,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// `production` switches log output to newline-delimited JSON.
    pub production: bool,

    /// Comma-separated list of allowed CORS origins; `None` allows all.
    pub cors_allowed_origins: Option<String>,

    /// When `true`, `/api` routes require a valid `X-API-Key` header.
    pub require_api_key: bool,

    /// Dispatcher sleep between empty claim attempts (ms).
    pub dispatch_idle_ms: u64,

    /// How often the backend set is re-read from the registry (s).
    pub registry_refresh_secs: u64,

    /// Monitor progress-poll interval (ms).
    pub poll_interval_ms: u64,

    /// Grace period before pending jobs for unknown backends fail (s).
    pub unknown_backend_grace_secs: u64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("EASEL_BIND", "0.0.0.0:9191"),
            storage_dir: PathBuf::from(env_or("EASEL_STORAGE_DIR", "./data")),
            output_dir: PathBuf::from(env_or("EASEL_OUTPUT_DIR", "./output")),
            model_root: std::env::var("EASEL_MODEL_ROOT").ok().map(PathBuf::from),
            log_level: env_or("EASEL_LOG", "info"),
            production: std::env::var("EASEL_ENV")
                .map(|v| v.eq_ignore_ascii_case("production"))
                .unwrap_or(false),
            cors_allowed_origins: std::env::var("EASEL_CORS_ORIGINS").ok(),
            require_api_key: std::env::var("EASEL_REQUIRE_API_KEY")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            dispatch_idle_ms: parse_env("EASEL_DISPATCH_IDLE_MS", 500),
            registry_refresh_secs: parse_env("EASEL_REGISTRY_REFRESH_SECS", 5),
            poll_interval_ms: parse_env("EASEL_POLL_INTERVAL_MS", 1000),
            unknown_backend_grace_secs: parse_env("EASEL_UNKNOWN_BACKEND_GRACE_SECS", 30),
        }
    }

    /// Dispatcher tunables derived from this configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut cfg = DispatcherConfig::new(self.output_dir.clone());
        cfg.idle_poll = Duration::from_millis(self.dispatch_idle_ms);
        cfg.registry_refresh = Duration::from_secs(self.registry_refresh_secs);
        cfg.unknown_backend_grace = Duration::from_secs(self.unknown_backend_grace_secs);
        cfg.monitor.poll_interval = Duration::from_millis(self.poll_interval_ms);
        cfg
    }

    /// Optional per-backend model-path hint, e.g.
    /// `EASEL_MODEL_PATH_HINT_FORGE_MAIN=/srv/models` for alias
    /// `forge-main`.
    pub fn model_path_hint(&self, alias: &str) -> Option<String> {
        let key: String = alias
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        std::env::var(format!("EASEL_MODEL_PATH_HINT_{key}")).ok()
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
