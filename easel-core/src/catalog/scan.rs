//! Filesystem scan: walk a model tree and upsert catalog entries.

use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::sidecar::{parse_sidecar, read_embedded_metadata, SidecarMetadata};
use super::{CatalogStore, MetadataSource, MetadataStatus, ModelKind};
use crate::db::now_str;
use crate::error::CoreError;

/// File extensions treated as model files.
const MODEL_EXTENSIONS: &[&str] = &["safetensors", "pt", "ckpt"];

/// AutoV2 hashes are derived from the first megabyte of the file.
const AUTOV2_SAMPLE_BYTES: usize = 1024 * 1024;

/// Counters returned from a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub files_seen: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped_duplicates: u64,
    pub rejected: u64,
    pub errors: u64,
}

enum IngestOutcome {
    Inserted,
    Updated,
    SkippedDuplicate,
    Rejected,
}

impl CatalogStore {
    /// Recursively walk `root` and upsert an entry per model file found.
    ///
    /// Re-scanning an unchanged tree yields an identical entry set; files
    /// whose content is already catalogued under another path (same AutoV2
    /// hash or version id) are suppressed as duplicates.
    pub async fn scan(&self, root: &Path) -> Result<ScanStats, CoreError> {
        let mut stats = ScanStats::default();

        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let ext = match path.extension().and_then(|e| e.to_str()) {
                Some(e) => e.to_ascii_lowercase(),
                None => continue,
            };
            if !MODEL_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            stats.files_seen += 1;

            match self.ingest_file(path, &ext).await {
                Ok(IngestOutcome::Inserted) => stats.inserted += 1,
                Ok(IngestOutcome::Updated) => stats.updated += 1,
                Ok(IngestOutcome::SkippedDuplicate) => stats.skipped_duplicates += 1,
                Ok(IngestOutcome::Rejected) => {
                    tracing::warn!(path = %path.display(), "duplicate filename without identifying hash; rejected");
                    stats.rejected += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to ingest model file");
                    stats.errors += 1;
                }
            }
        }

        tracing::info!(
            root = %root.display(),
            files_seen = stats.files_seen,
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped_duplicates,
            rejected = stats.rejected,
            errors = stats.errors,
            "catalog scan finished"
        );
        Ok(stats)
    }

    async fn ingest_file(&self, path: &Path, ext: &str) -> Result<IngestOutcome, CoreError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CoreError::Internal("model path without a filename".into()))?;
        let local_dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let kind = infer_kind(path, &filename);
        let (mut meta, status, source) = load_metadata(path, ext);

        if meta.hash_autov2.is_none() {
            meta.hash_autov2 = autov2_of_file(path).ok();
        }
        let preview_path = local_preview(path);

        // Pick the row this file maps onto: its own path first, then
        // content identity (version id / AutoV2) for files already
        // catalogued elsewhere.
        if let Some(existing) = self.find_by_path(&local_dir, &filename).await? {
            self.update_entry(existing.id, kind, &meta, status, source, preview_path.as_deref())
                .await?;
            return Ok(IngestOutcome::Updated);
        }
        if let Some(vid) = meta.version_id {
            if self.find_by_version_id(vid).await?.is_some() {
                return Ok(IngestOutcome::SkippedDuplicate);
            }
        }
        if let Some(hash) = &meta.hash_autov2 {
            if self.find_by_hash(hash, super::HashKind::AutoV2).await?.is_some() {
                return Ok(IngestOutcome::SkippedDuplicate);
            }
        }
        if meta.hash_autov2.is_none() && meta.hash_sha256.is_none() {
            let hashless_twin = self
                .find_by_filename(&filename)
                .await?
                .into_iter()
                .any(|e| e.hash_autov2.is_none() && e.hash_sha256.is_none());
            if hashless_twin {
                return Ok(IngestOutcome::Rejected);
            }
        }

        self.insert_entry(
            kind,
            &filename,
            &local_dir,
            &meta,
            status,
            source,
            preview_path.as_deref(),
        )
        .await?;
        Ok(IngestOutcome::Inserted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_entry(
        &self,
        kind: ModelKind,
        filename: &str,
        local_dir: &str,
        meta: &SidecarMetadata,
        status: MetadataStatus,
        source: MetadataSource,
        preview_path: Option<&str>,
    ) -> Result<(), CoreError> {
        let words = serde_json::to_string(&meta.trained_words)
            .unwrap_or_else(|_| "[]".to_owned());
        sqlx::query(
            "INSERT INTO models (kind, filename, local_dir, hash_autov2, hash_sha256, \
             model_id, version_id, display_name, base_model, trained_words, preview_path, \
             preview_url, description, metadata_status, metadata_source, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
        )
        .bind(kind.as_str())
        .bind(filename)
        .bind(local_dir)
        .bind(&meta.hash_autov2)
        .bind(&meta.hash_sha256)
        .bind(meta.model_id)
        .bind(meta.version_id)
        .bind(&meta.display_name)
        .bind(&meta.base_model)
        .bind(&words)
        .bind(preview_path)
        .bind(&meta.preview_url)
        .bind(&meta.description)
        .bind(status.as_str())
        .bind(source.as_str())
        .bind(now_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_entry(
        &self,
        id: i64,
        kind: ModelKind,
        meta: &SidecarMetadata,
        status: MetadataStatus,
        source: MetadataSource,
        preview_path: Option<&str>,
    ) -> Result<(), CoreError> {
        let words = serde_json::to_string(&meta.trained_words)
            .unwrap_or_else(|_| "[]".to_owned());
        sqlx::query(
            "UPDATE models SET kind = ?1, hash_autov2 = ?2, hash_sha256 = ?3, model_id = ?4, \
             version_id = ?5, display_name = ?6, base_model = ?7, trained_words = ?8, \
             preview_path = ?9, preview_url = ?10, description = ?11, metadata_status = ?12, \
             metadata_source = ?13, updated_at = ?14 WHERE id = ?15",
        )
        .bind(kind.as_str())
        .bind(&meta.hash_autov2)
        .bind(&meta.hash_sha256)
        .bind(meta.model_id)
        .bind(meta.version_id)
        .bind(&meta.display_name)
        .bind(&meta.base_model)
        .bind(&words)
        .bind(preview_path)
        .bind(&meta.preview_url)
        .bind(&meta.description)
        .bind(status.as_str())
        .bind(source.as_str())
        .bind(now_str())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Type heuristics: a `lora` path component or a `.lora.` filename
/// substring marks a LoRA; everything else is a checkpoint.
fn infer_kind(path: &Path, filename: &str) -> ModelKind {
    let in_lora_dir = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .any(|c| c.to_ascii_lowercase().contains("lora"));
    if in_lora_dir || filename.to_ascii_lowercase().contains(".lora.") {
        ModelKind::Lora
    } else {
        ModelKind::Checkpoint
    }
}

/// Try the metadata sources in preference order.
fn load_metadata(path: &Path, ext: &str) -> (SidecarMetadata, MetadataStatus, MetadataSource) {
    let mut error_seen = false;

    let candidates = [
        (path.with_extension("json"), MetadataSource::SidecarPrimary, true),
        (
            path.with_extension("civitai.json"),
            MetadataSource::SidecarSecondary,
            false,
        ),
    ];
    for (candidate, source, strict) in candidates {
        if !candidate.is_file() {
            continue;
        }
        let parsed = std::fs::read_to_string(&candidate)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| e.to_string())
            });
        match parsed {
            Ok(doc) => {
                let meta = parse_sidecar(&doc, strict);
                let status = meta.status();
                return (meta, status, source);
            }
            Err(e) => {
                tracing::warn!(sidecar = %candidate.display(), error = %e, "unreadable sidecar");
                error_seen = true;
            }
        }
    }

    if ext == "safetensors" {
        match read_embedded_metadata(path) {
            Ok(Some(meta)) => {
                let status = meta.status();
                return (meta, status, MetadataSource::Embedded);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable safetensors header");
                error_seen = true;
            }
        }
    }

    let status = if error_seen {
        MetadataStatus::Error
    } else {
        MetadataStatus::None
    };
    (SidecarMetadata::default(), status, MetadataSource::None)
}

/// AutoV2: first 10 hex chars of SHA-256 over the file's first megabyte.
fn autov2_of_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; AUTOV2_SAMPLE_BYTES];
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..])? {
            0 => break,
            n => read += n,
        }
    }
    let digest = Sha256::digest(&buf[..read]);
    Ok(format!("{digest:x}")[..10].to_owned())
}

/// A preview image shipped next to the model file.
fn local_preview(path: &Path) -> Option<String> {
    for candidate in [
        path.with_extension("preview.png"),
        path.with_extension("png"),
    ] {
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}
