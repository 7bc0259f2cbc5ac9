//! Backend registry: the durable list of named remote backends.
//!
//! Shares its database file with the credential store (see
//! [`crate::credentials`]); both are constructed from [`RegistryStore::open`].

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::credentials::CredentialStore;
use crate::db::{now_str, open_pool, parse_ts};
use crate::error::CoreError;

/// Basic-auth pair for backends that require it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// One registered remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    /// Unique name; jobs are pinned to it at admission.
    pub alias: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<BasicAuth>,
    /// Advisory path where the backend keeps its model files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_root_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when registering or updating a backend.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub alias: String,
    pub base_url: String,
    pub auth: Option<BasicAuth>,
    pub model_root_path: Option<String>,
}

/// SQLite-backed registry.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    pool: SqlitePool,
}

impl RegistryStore {
    /// Open (or create) the registry database at `path` and run the
    /// additive migration step for both the backend and credential tables.
    pub async fn open(path: &Path) -> Result<Self, CoreError> {
        let pool = open_pool(path).await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// A credential store sharing this registry's database file.
    pub fn credentials(&self) -> CredentialStore {
        CredentialStore::new(self.pool.clone())
    }

    /// Insert or update a backend by alias.
    pub async fn upsert(&self, spec: BackendSpec) -> Result<Backend, CoreError> {
        let now = now_str();
        let (user, pass) = match &spec.auth {
            Some(a) => (Some(a.username.clone()), Some(a.password.clone())),
            None => (None, None),
        };
        sqlx::query(
            "INSERT INTO backends (alias, base_url, auth_username, auth_password, \
             model_root_path, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(alias) DO UPDATE SET base_url = ?2, auth_username = ?3, \
             auth_password = ?4, model_root_path = ?5, updated_at = ?6",
        )
        .bind(&spec.alias)
        .bind(&spec.base_url)
        .bind(&user)
        .bind(&pass)
        .bind(&spec.model_root_path)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&spec.alias)
            .await?
            .ok_or_else(|| CoreError::BackendNotFound(spec.alias))
    }

    /// Remove a backend.  Permitted even with pending jobs targeting it;
    /// those surface as failures at dispatch time.
    pub async fn delete(&self, alias: &str) -> Result<(), CoreError> {
        let res = sqlx::query("DELETE FROM backends WHERE alias = ?1")
            .bind(alias)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CoreError::BackendNotFound(alias.to_owned()));
        }
        Ok(())
    }

    pub async fn get(&self, alias: &str) -> Result<Option<Backend>, CoreError> {
        let row: Option<BackendRow> = sqlx::query_as(
            "SELECT alias, base_url, auth_username, auth_password, model_root_path, \
             created_at, updated_at FROM backends WHERE alias = ?1",
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Backend::from))
    }

    pub async fn list(&self) -> Result<Vec<Backend>, CoreError> {
        let rows: Vec<BackendRow> = sqlx::query_as(
            "SELECT alias, base_url, auth_username, auth_password, model_root_path, \
             created_at, updated_at FROM backends ORDER BY alias",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Backend::from).collect())
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS backends (
            alias TEXT PRIMARY KEY,
            base_url TEXT NOT NULL,
            auth_username TEXT,
            auth_password TEXT,
            model_root_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS api_keys (
            key_id TEXT PRIMARY KEY,
            display_key TEXT NOT NULL,
            secret_hash TEXT NOT NULL UNIQUE,
            active INTEGER NOT NULL DEFAULT 1,
            rate_tier TEXT,
            custom_limits TEXT,
            created_at TEXT NOT NULL,
            last_used_at TEXT
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct BackendRow {
    alias: String,
    base_url: String,
    auth_username: Option<String>,
    auth_password: Option<String>,
    model_root_path: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<BackendRow> for Backend {
    fn from(row: BackendRow) -> Self {
        let auth = match (row.auth_username, row.auth_password) {
            (Some(username), Some(password)) => Some(BasicAuth { username, password }),
            _ => None,
        };
        Backend {
            alias: row.alias,
            base_url: row.base_url,
            auth,
            model_root_path: row.model_root_path,
            created_at: parse_ts(&row.created_at),
            updated_at: parse_ts(&row.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (RegistryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(&dir.path().join("registry.db"))
            .await
            .unwrap();
        (store, dir)
    }

    fn spec(alias: &str, url: &str) -> BackendSpec {
        BackendSpec {
            alias: alias.to_owned(),
            base_url: url.to_owned(),
            auth: None,
            model_root_path: None,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates() {
        let (store, _dir) = store().await;
        let b = store.upsert(spec("a", "http://one/")).await.unwrap();
        assert_eq!(b.base_url, "http://one/");

        let b = store
            .upsert(BackendSpec {
                auth: Some(BasicAuth {
                    username: "u".into(),
                    password: "p".into(),
                }),
                ..spec("a", "http://two/")
            })
            .await
            .unwrap();
        assert_eq!(b.base_url, "http://two/");
        assert_eq!(b.auth.as_ref().unwrap().username, "u");

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_unknown_alias_is_typed() {
        let (store, _dir) = store().await;
        let err = store.delete("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::BackendNotFound(_)));

        store.upsert(spec("a", "http://one/")).await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }
}
