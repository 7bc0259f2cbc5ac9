//! Local model catalog: the durable index of model files present on disk.
//!
//! The catalog is the only matcher consulted when a job's checkpoint
//! reference has to be resolved to a concrete file.  Resolution order:
//! version id, AutoV2 hash, SHA-256 hash, path+filename.  No fuzzy name
//! matching happens here; any name-to-id bridging happened at ingest.

mod scan;
mod sidecar;

pub use scan::ScanStats;
pub use sidecar::SidecarMetadata;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::{now_str, open_pool, parse_ts};
use crate::error::CoreError;

/// What a catalog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Checkpoint,
    Lora,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Checkpoint => "checkpoint",
            ModelKind::Lora => "lora",
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkpoint" => Ok(ModelKind::Checkpoint),
            "lora" => Ok(ModelKind::Lora),
            other => Err(CoreError::InvalidFieldValue(format!(
                "unknown model kind '{other}'"
            ))),
        }
    }
}

/// How much identifying metadata was recovered for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    /// Ids and at least one hash present.
    Complete,
    /// Some identifying fields present.
    Partial,
    /// A source parsed but yielded nothing identifying.
    Incomplete,
    /// No metadata source found.
    None,
    /// A source existed but could not be read or parsed.
    Error,
}

impl MetadataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataStatus::Complete => "complete",
            MetadataStatus::Partial => "partial",
            MetadataStatus::Incomplete => "incomplete",
            MetadataStatus::None => "none",
            MetadataStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for MetadataStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(MetadataStatus::Complete),
            "partial" => Ok(MetadataStatus::Partial),
            "incomplete" => Ok(MetadataStatus::Incomplete),
            "none" => Ok(MetadataStatus::None),
            "error" => Ok(MetadataStatus::Error),
            other => Err(CoreError::InvalidFieldValue(format!(
                "unknown metadata status '{other}'"
            ))),
        }
    }
}

/// Which source the metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    /// `<basename>.json`.
    SidecarPrimary,
    /// `<basename>.civitai.json`.
    SidecarSecondary,
    /// The safetensors header.
    Embedded,
    None,
}

impl MetadataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataSource::SidecarPrimary => "sidecar_primary",
            MetadataSource::SidecarSecondary => "sidecar_secondary",
            MetadataSource::Embedded => "embedded",
            MetadataSource::None => "none",
        }
    }
}

impl std::str::FromStr for MetadataSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sidecar_primary" => Ok(MetadataSource::SidecarPrimary),
            "sidecar_secondary" => Ok(MetadataSource::SidecarSecondary),
            "embedded" => Ok(MetadataSource::Embedded),
            "none" => Ok(MetadataSource::None),
            other => Err(CoreError::InvalidFieldValue(format!(
                "unknown metadata source '{other}'"
            ))),
        }
    }
}

/// Which hash column a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    AutoV2,
    Sha256,
}

/// One locally present model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub kind: ModelKind,
    pub filename: String,
    pub local_dir: String,
    pub hash_autov2: Option<String>,
    pub hash_sha256: Option<String>,
    pub model_id: Option<i64>,
    pub version_id: Option<i64>,
    pub display_name: Option<String>,
    pub base_model: Option<String>,
    pub trained_words: Vec<String>,
    pub preview_path: Option<String>,
    pub preview_url: Option<String>,
    pub description: Option<String>,
    pub metadata_status: MetadataStatus,
    pub metadata_source: MetadataSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    /// Absolute path of the model file this entry describes.
    pub fn file_path(&self) -> PathBuf {
        Path::new(&self.local_dir).join(&self.filename)
    }
}

/// SQLite-backed catalog store.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl CatalogStore {
    /// Open (or create) the catalog database at `path` and run the
    /// additive migration step.
    pub async fn open(path: &Path) -> Result<Self, CoreError> {
        let pool = open_pool(path).await?;
        migrate(&pool).await?;
        Ok(Self {
            pool,
            db_path: path.to_owned(),
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<CatalogEntry>, CoreError> {
        let row: Option<EntryRow> =
            sqlx::query_as(&format!("SELECT {ENTRY_COLUMNS} FROM models WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(CatalogEntry::try_from).transpose()
    }

    pub async fn find_by_version_id(
        &self,
        version_id: i64,
    ) -> Result<Option<CatalogEntry>, CoreError> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM models WHERE version_id = ?1"
        ))
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CatalogEntry::try_from).transpose()
    }

    pub async fn find_by_hash(
        &self,
        hash: &str,
        kind: HashKind,
    ) -> Result<Option<CatalogEntry>, CoreError> {
        let column = match kind {
            HashKind::AutoV2 => "hash_autov2",
            HashKind::Sha256 => "hash_sha256",
        };
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM models WHERE {column} = ?1 COLLATE NOCASE LIMIT 1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CatalogEntry::try_from).transpose()
    }

    pub async fn find_by_path(
        &self,
        local_dir: &str,
        filename: &str,
    ) -> Result<Option<CatalogEntry>, CoreError> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM models WHERE local_dir = ?1 AND filename = ?2"
        ))
        .bind(local_dir)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CatalogEntry::try_from).transpose()
    }

    pub async fn find_by_filename(&self, filename: &str) -> Result<Vec<CatalogEntry>, CoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM models WHERE filename = ?1 ORDER BY local_dir"
        ))
        .bind(filename)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    pub async fn list(&self, kind: Option<ModelKind>) -> Result<Vec<CatalogEntry>, CoreError> {
        let rows: Vec<EntryRow> = match kind {
            Some(k) => {
                sqlx::query_as(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM models WHERE kind = ?1 \
                     ORDER BY local_dir, filename"
                ))
                .bind(k.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM models ORDER BY local_dir, filename"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    /// Record that `alias` is known to have this entry.
    pub async fn mark_available_on(&self, entry_id: i64, alias: &str) -> Result<(), CoreError> {
        if self.get(entry_id).await?.is_none() {
            return Err(CoreError::CatalogEntryNotFound(entry_id.to_string()));
        }
        sqlx::query(
            "INSERT INTO model_backends (model_pk, backend_alias, last_seen_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(model_pk, backend_alias) DO UPDATE SET last_seen_at = ?3",
        )
        .bind(entry_id)
        .bind(alias)
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_unavailable_on(&self, entry_id: i64, alias: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM model_backends WHERE model_pk = ?1 AND backend_alias = ?2")
            .bind(entry_id)
            .bind(alias)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Aliases known to have this entry, with last-seen timestamps.
    pub async fn seen_on(&self, entry_id: i64) -> Result<Vec<(String, DateTime<Utc>)>, CoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT backend_alias, last_seen_at FROM model_backends \
             WHERE model_pk = ?1 ORDER BY backend_alias",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(alias, seen)| (alias, parse_ts(&seen)))
            .collect())
    }

    /// Destructively empty the catalog.  A timestamped backup of the
    /// database file is written first; this is the only destructive
    /// operation the store permits.
    pub async fn reset(&self) -> Result<PathBuf, CoreError> {
        // Fold the WAL into the main file so the backup is self-contained.
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;

        let backup = self.db_path.with_extension(format!(
            "db.bak.{}",
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        std::fs::copy(&self.db_path, &backup)?;

        sqlx::query("DELETE FROM model_backends")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM models").execute(&self.pool).await?;
        tracing::info!(backup = %backup.display(), "catalog reset");
        Ok(backup)
    }

    /// Resolve a job's checkpoint reference to a catalog entry.
    ///
    /// Order: explicit version id, AutoV2 hash, SHA-256 hash, then
    /// path+filename from `checkpoint_name`.
    pub async fn resolve_checkpoint(
        &self,
        params: &serde_json::Value,
    ) -> Result<Option<CatalogEntry>, CoreError> {
        let version_id = ["checkpoint_version_id", "model_version_id"]
            .iter()
            .find_map(|k| params.get(k).and_then(|v| v.as_i64()));
        if let Some(vid) = version_id {
            if let Some(entry) = self.find_by_version_id(vid).await? {
                return Ok(Some(entry));
            }
        }

        let hash = ["checkpoint_hash", "sd_model_hash"]
            .iter()
            .find_map(|k| params.get(k).and_then(|v| v.as_str()));
        if let Some(h) = hash.map(str::trim).filter(|h| !h.is_empty()) {
            let kind = match h.len() {
                10 => Some(HashKind::AutoV2),
                64 => Some(HashKind::Sha256),
                _ => None,
            };
            if let Some(kind) = kind {
                if let Some(entry) = self.find_by_hash(h, kind).await? {
                    return Ok(Some(entry));
                }
            }
        }

        let name = params.get("checkpoint_name").and_then(|v| v.as_str());
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            let (dir, file) = match name.rsplit_once('/') {
                Some((d, f)) => (d, f),
                None => ("", name),
            };
            let candidates = self.find_by_filename(file).await?;
            let found = candidates
                .into_iter()
                .find(|e| dir.is_empty() || e.local_dir.ends_with(dir));
            return Ok(found);
        }

        Ok(None)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const ENTRY_COLUMNS: &str = "id, kind, filename, local_dir, hash_autov2, hash_sha256, model_id, \
     version_id, display_name, base_model, trained_words, preview_path, preview_url, \
     description, metadata_status, metadata_source, created_at, updated_at";

async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            filename TEXT NOT NULL,
            local_dir TEXT NOT NULL,
            hash_autov2 TEXT,
            hash_sha256 TEXT,
            model_id INTEGER,
            version_id INTEGER,
            display_name TEXT,
            base_model TEXT,
            trained_words TEXT,
            preview_path TEXT,
            preview_url TEXT,
            description TEXT,
            metadata_status TEXT NOT NULL DEFAULT 'none',
            metadata_source TEXT NOT NULL DEFAULT 'none',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (local_dir, filename)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_models_version_id \
         ON models (version_id) WHERE version_id IS NOT NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_models_autov2 ON models (hash_autov2)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS model_backends (
            model_pk INTEGER NOT NULL REFERENCES models (id) ON DELETE CASCADE,
            backend_alias TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            PRIMARY KEY (model_pk, backend_alias)
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    kind: String,
    filename: String,
    local_dir: String,
    hash_autov2: Option<String>,
    hash_sha256: Option<String>,
    model_id: Option<i64>,
    version_id: Option<i64>,
    display_name: Option<String>,
    base_model: Option<String>,
    trained_words: Option<String>,
    preview_path: Option<String>,
    preview_url: Option<String>,
    description: Option<String>,
    metadata_status: String,
    metadata_source: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<EntryRow> for CatalogEntry {
    type Error = CoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let trained_words = row
            .trained_words
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Ok(CatalogEntry {
            id: row.id,
            kind: row.kind.parse()?,
            filename: row.filename,
            local_dir: row.local_dir,
            hash_autov2: row.hash_autov2,
            hash_sha256: row.hash_sha256,
            model_id: row.model_id,
            version_id: row.version_id,
            display_name: row.display_name,
            base_model: row.base_model,
            trained_words,
            preview_path: row.preview_path,
            preview_url: row.preview_url,
            description: row.description,
            metadata_status: row.metadata_status.parse()?,
            metadata_source: row.metadata_source.parse()?,
            created_at: parse_ts(&row.created_at),
            updated_at: parse_ts(&row.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (CatalogStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(&dir.path().join("catalog.db"))
            .await
            .unwrap();
        (store, dir)
    }

    async fn seed(
        store: &CatalogStore,
        filename: &str,
        local_dir: &str,
        version_id: Option<i64>,
        autov2: Option<&str>,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO models (kind, filename, local_dir, hash_autov2, version_id, \
             metadata_status, metadata_source, created_at, updated_at) \
             VALUES ('checkpoint', ?1, ?2, ?3, ?4, 'partial', 'sidecar_primary', ?5, ?5)",
        )
        .bind(filename)
        .bind(local_dir)
        .bind(autov2)
        .bind(version_id)
        .bind(crate::db::now_str())
        .execute(store.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn resolution_prefers_version_id_over_hash_and_path() {
        let (store, _dir) = store().await;
        let by_version = seed(&store, "a.safetensors", "/m/sd", Some(42), None).await;
        let by_hash = seed(&store, "b.safetensors", "/m/sd", None, Some("abcdef0123")).await;
        seed(&store, "c.safetensors", "/m/sd", None, None).await;

        let entry = store
            .resolve_checkpoint(&serde_json::json!({
                "checkpoint_version_id": 42,
                "sd_model_hash": "abcdef0123",
                "checkpoint_name": "c.safetensors",
            }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.id, by_version);

        let entry = store
            .resolve_checkpoint(&serde_json::json!({
                "sd_model_hash": "abcdef0123",
                "checkpoint_name": "c.safetensors",
            }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.id, by_hash);
    }

    #[tokio::test]
    async fn resolution_falls_back_to_path_suffix() {
        let (store, _dir) = store().await;
        seed(&store, "m.safetensors", "/models/sd15", None, None).await;
        let sdxl = seed(&store, "m.safetensors", "/models/sdxl", None, None).await;

        let entry = store
            .resolve_checkpoint(&serde_json::json!({"checkpoint_name": "sdxl/m.safetensors"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.id, sdxl);

        // No reference at all resolves to nothing.
        assert!(store
            .resolve_checkpoint(&serde_json::json!({}))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn seen_on_backend_round_trip() {
        let (store, _dir) = store().await;
        let id = seed(&store, "a.safetensors", "/m", None, None).await;

        store.mark_available_on(id, "forge-1").await.unwrap();
        store.mark_available_on(id, "forge-1").await.unwrap();
        store.mark_available_on(id, "forge-2").await.unwrap();
        assert_eq!(store.seen_on(id).await.unwrap().len(), 2);

        store.mark_unavailable_on(id, "forge-1").await.unwrap();
        let seen = store.seen_on(id).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "forge-2");

        let err = store.mark_available_on(999, "forge-1").await.unwrap_err();
        assert!(matches!(err, CoreError::CatalogEntryNotFound(_)));
    }

    #[tokio::test]
    async fn reset_backs_up_then_truncates() {
        let (store, dir) = store().await;
        seed(&store, "a.safetensors", "/m", None, None).await;

        let backup = store.reset().await.unwrap();
        assert!(backup.exists());
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains(".bak."));
        assert!(store.list(None).await.unwrap().is_empty());
        let _ = dir;
    }
}
