//! Metadata extraction for catalog entries.
//!
//! Sources, in preference order: `<basename>.json` (strict field checks),
//! `<basename>.civitai.json` (same schema, looser validation), and the
//! safetensors embedded header as a last resort.

use std::io::Read;
use std::path::Path;

use serde_json::Value;

use super::MetadataStatus;

/// Identifying fields recovered from a metadata source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarMetadata {
    pub model_id: Option<i64>,
    pub version_id: Option<i64>,
    pub display_name: Option<String>,
    pub base_model: Option<String>,
    pub trained_words: Vec<String>,
    pub preview_url: Option<String>,
    pub description: Option<String>,
    pub hash_autov2: Option<String>,
    pub hash_sha256: Option<String>,
}

impl SidecarMetadata {
    /// Grade how identifying the recovered fields are.
    pub fn status(&self) -> MetadataStatus {
        let has_hash = self.hash_autov2.is_some() || self.hash_sha256.is_some();
        let has_ids = self.model_id.is_some() && self.version_id.is_some();
        if has_ids && has_hash {
            MetadataStatus::Complete
        } else if self.version_id.is_some() || has_hash {
            MetadataStatus::Partial
        } else {
            MetadataStatus::Incomplete
        }
    }
}

/// Parse a sidecar document.
///
/// `strict` applies to the primary sidecar: identifying ids must be
/// numeric if present.  The secondary (civitai) sidecar additionally
/// accepts ids encoded as strings.
pub fn parse_sidecar(doc: &Value, strict: bool) -> SidecarMetadata {
    let as_id = |v: &Value| -> Option<i64> {
        match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) if !strict => s.parse().ok(),
            _ => None,
        }
    };

    let mut meta = SidecarMetadata {
        model_id: doc.get("modelId").and_then(as_id),
        version_id: doc
            .get("modelVersionId")
            .or_else(|| doc.get("id"))
            .and_then(as_id),
        display_name: doc
            .get("name")
            .or_else(|| doc.get("model").and_then(|m| m.get("name")))
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        base_model: doc
            .get("baseModel")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        trained_words: doc
            .get("trainedWords")
            .and_then(|v| v.as_array())
            .map(|words| {
                words
                    .iter()
                    .filter_map(|w| w.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default(),
        preview_url: doc
            .get("previewUrl")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .or_else(|| {
                doc.get("images")
                    .and_then(|i| i.get(0))
                    .and_then(|img| img.get("url"))
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
            }),
        description: doc
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        ..Default::default()
    };

    meta.hash_autov2 = hash_field(doc, &["hash_autov2", "AutoV2"], 10);
    meta.hash_sha256 = hash_field(doc, &["hash_sha256", "SHA256"], 64);
    meta
}

/// A hash by any of its recognized key spellings, flat or under `hashes`.
fn hash_field(doc: &Value, keys: &[&str], expect_len: usize) -> Option<String> {
    let null = Value::Null;
    let sources = [doc, doc.get("hashes").unwrap_or(&null)];
    for source in sources {
        for key in keys {
            if let Some(h) = source.get(key).and_then(|v| v.as_str()) {
                let h = h.trim();
                if h.len() == expect_len && h.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Some(h.to_ascii_lowercase());
                }
            }
        }
    }
    None
}

/// Read identifying metadata out of a safetensors header.
///
/// Layout: 8 bytes little-endian header length, then that many bytes of
/// JSON whose `__metadata__` object carries free-form string pairs.
pub fn read_embedded_metadata(path: &Path) -> std::io::Result<Option<SidecarMetadata>> {
    // Headers are small; anything past this bound is not a header.
    const MAX_HEADER_BYTES: u64 = 16 * 1024 * 1024;

    let mut file = std::fs::File::open(path)?;
    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)?;
    let header_len = u64::from_le_bytes(len_buf);
    if header_len == 0 || header_len > MAX_HEADER_BYTES {
        return Ok(None);
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    let doc: Value = match serde_json::from_slice(&header) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let Some(embedded) = doc.get("__metadata__") else {
        return Ok(None);
    };

    let get = |key: &str| embedded.get(key).and_then(|v| v.as_str()).map(str::to_owned);
    let mut meta = SidecarMetadata {
        display_name: get("modelspec.title").or_else(|| get("ss_output_name")),
        base_model: get("modelspec.architecture").or_else(|| get("ss_base_model_version")),
        ..Default::default()
    };
    meta.hash_sha256 = get("modelspec.hash_sha256")
        .map(|h| h.trim_start_matches("0x").to_ascii_lowercase())
        .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()));
    Ok(Some(meta))
}
