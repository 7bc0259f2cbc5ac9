//! Credential store: API keys consulted by the admission filter.
//!
//! Secrets are stored as SHA-256 hashes; the plaintext key exists only in
//! the return value of [`CredentialStore::create`].  `last_used_at` is
//! written lazily by the caller (fire-and-forget) so verification stays a
//! single read.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{now_str, parse_ts};
use crate::error::CoreError;

/// One issued API key (without its secret).
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub key_id: String,
    /// Redacted form shown in listings, e.g. `easel_3fa9c1…`.
    pub display_key: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_limits: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Store handle; shares the registry's database file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Issue a new key.  Returns the credential record and the plaintext
    /// key, which is never stored and cannot be recovered later.
    pub async fn create(
        &self,
        rate_tier: Option<String>,
        custom_limits: Option<serde_json::Value>,
    ) -> Result<(Credential, String), CoreError> {
        let key_id = Uuid::new_v4().to_string();
        let plaintext = format!("easel_{}", Uuid::new_v4().simple());
        let display_key = format!("{}…", &plaintext[..12]);
        let now = now_str();

        sqlx::query(
            "INSERT INTO api_keys (key_id, display_key, secret_hash, active, rate_tier, \
             custom_limits, created_at) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
        )
        .bind(&key_id)
        .bind(&display_key)
        .bind(hash_secret(&plaintext))
        .bind(&rate_tier)
        .bind(custom_limits.as_ref().map(|v| v.to_string()))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let cred = self
            .get(&key_id)
            .await?
            .ok_or_else(|| CoreError::Internal("credential vanished after insert".into()))?;
        Ok((cred, plaintext))
    }

    /// Look up an active credential by plaintext key.
    pub async fn verify(&self, plaintext: &str) -> Result<Option<Credential>, CoreError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT key_id, display_key, active, rate_tier, custom_limits, created_at, \
             last_used_at FROM api_keys WHERE secret_hash = ?1 AND active = 1",
        )
        .bind(hash_secret(plaintext))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Credential::from))
    }

    /// Record that a key was just used.  Lazy; callers fire-and-forget.
    pub async fn touch_last_used(&self, key_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ?1 WHERE key_id = ?2")
            .bind(now_str())
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deactivate a key.  Verification fails for it from now on.
    pub async fn revoke(&self, key_id: &str) -> Result<(), CoreError> {
        let res = sqlx::query("UPDATE api_keys SET active = 0 WHERE key_id = ?1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CoreError::Unauthorized);
        }
        Ok(())
    }

    pub async fn get(&self, key_id: &str) -> Result<Option<Credential>, CoreError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT key_id, display_key, active, rate_tier, custom_limits, created_at, \
             last_used_at FROM api_keys WHERE key_id = ?1",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Credential::from))
    }

    pub async fn list(&self) -> Result<Vec<Credential>, CoreError> {
        let rows: Vec<CredentialRow> = sqlx::query_as(
            "SELECT key_id, display_key, active, rate_tier, custom_limits, created_at, \
             last_used_at FROM api_keys ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Credential::from).collect())
    }
}

fn hash_secret(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    format!("{digest:x}")
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    key_id: String,
    display_key: String,
    active: i64,
    rate_tier: Option<String>,
    custom_limits: Option<String>,
    created_at: String,
    last_used_at: Option<String>,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Credential {
            key_id: row.key_id,
            display_key: row.display_key,
            active: row.active != 0,
            rate_tier: row.rate_tier,
            custom_limits: row
                .custom_limits
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            created_at: parse_ts(&row.created_at),
            last_used_at: row.last_used_at.as_deref().map(parse_ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryStore;

    async fn store() -> (CredentialStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open(&dir.path().join("registry.db"))
            .await
            .unwrap();
        (registry.credentials(), dir)
    }

    #[tokio::test]
    async fn issued_key_verifies_until_revoked() {
        let (store, _dir) = store().await;
        let (cred, plaintext) = store.create(Some("default".into()), None).await.unwrap();
        assert!(plaintext.starts_with("easel_"));
        assert!(cred.active);

        let found = store.verify(&plaintext).await.unwrap().unwrap();
        assert_eq!(found.key_id, cred.key_id);

        store.revoke(&cred.key_id).await.unwrap();
        assert!(store.verify(&plaintext).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_key_does_not_verify() {
        let (store, _dir) = store().await;
        store.create(None, None).await.unwrap();
        assert!(store.verify("easel_wrong").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_updates_last_used() {
        let (store, _dir) = store().await;
        let (cred, _) = store.create(None, None).await.unwrap();
        assert!(cred.last_used_at.is_none());

        store.touch_last_used(&cred.key_id).await.unwrap();
        let got = store.get(&cred.key_id).await.unwrap().unwrap();
        assert!(got.last_used_at.is_some());
    }
}
