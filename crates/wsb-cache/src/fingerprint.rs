//! Stable keys for cache lookup and invalidation.
//!
//! Two digests are produced here. The *lookup key* is the primary key of the
//! persistent store and depends only on the configuration URI and the entity
//! type (plus the parent type for tasks). The *contents hash* decides whether
//! a stored row is still valid: it digests the site-state snapshot and, for
//! mutable configurations, the mtimes of every environment descriptor file.
//! MD5 is used strictly for change detection, never authentication.

use md5::{Digest, Md5};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// Bumped whenever the cached blob layout changes; stale rows from older
/// layouts then miss on their key instead of decoding garbage.
pub const LOOKUP_SCHEMA_VERSION: u32 = 2;

/// Identifies one configuration as seen by the hashing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFingerprint {
    pub uri: String,
    pub immutable: bool,
    /// `path -> mtime (ms since epoch)` for every descriptor file under the
    /// environment root. Empty for immutable configurations.
    pub descriptor_mtimes: BTreeMap<String, i64>,
}

impl ConfigFingerprint {
    /// Fingerprint for a configuration that can never change on disk
    /// (e.g. pinned to an immutable bundle). Only the URI participates, via
    /// the lookup key.
    pub fn immutable(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            immutable: true,
            descriptor_mtimes: BTreeMap::new(),
        }
    }

    /// Fingerprint for a mutable configuration: walks `env_root` and records
    /// the mtime of every environment descriptor (`.yml`) found under it.
    /// Unreadable entries are skipped; a vanished root yields an empty set,
    /// which still hashes deterministically.
    pub fn mutable(uri: impl Into<String>, env_root: &Path) -> Self {
        let mut descriptor_mtimes = BTreeMap::new();
        for entry in WalkDir::new(env_root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_descriptor = entry
                .path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml"))
                .unwrap_or(false);
            if !is_descriptor {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let mtime_ms = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            descriptor_mtimes.insert(entry.path().to_string_lossy().into_owned(), mtime_ms);
        }
        Self {
            uri: uri.into(),
            immutable: false,
            descriptor_mtimes,
        }
    }
}

/// Primary key of the persistent cache for one (configuration, entity type)
/// pair. For `Task` entities the parent entity type is appended so tasks
/// linked to different parents get independent rows.
pub fn lookup_key(config_uri: &str, entity_type: &str, parent_type: Option<&str>) -> String {
    let mut hasher = Md5::new();
    hasher.update(config_uri.as_bytes());
    hasher.update(b"::");
    hasher.update(entity_type.as_bytes());
    if let Some(parent) = parent_type {
        hasher.update(b"::");
        hasher.update(parent.as_bytes());
    }
    format!("{:x}_v{}", hasher.finalize(), LOOKUP_SCHEMA_VERSION)
}

/// 128-bit digest over the site-state snapshot plus the configuration
/// fingerprint. Records are digested in snapshot order as canonical JSON;
/// mutable configurations additionally contribute their descriptor mtimes
/// sorted by path.
pub fn contents_hash(site_state: &[Value], fingerprint: &ConfigFingerprint) -> [u8; 16] {
    let mut hasher = Md5::new();
    for record in site_state {
        let canon = canonicalize_json(record);
        // to_vec on an already-materialized Value cannot fail
        if let Ok(bytes) = serde_json::to_vec(&canon) {
            hasher.update(&bytes);
            hasher.update(b"\n");
        }
    }
    if !fingerprint.immutable {
        for (path, mtime) in &fingerprint.descriptor_mtimes {
            hasher.update(path.as_bytes());
            hasher.update(b"=");
            hasher.update(mtime.to_le_bytes());
            hasher.update(b";");
        }
    }
    hasher.finalize().into()
}

/// Object keys sorted recursively so semantically equal snapshots digest
/// identically regardless of source ordering.
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in pairs {
                out.insert(key.clone(), canonicalize_json(val));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize_json).collect()),
        _ => value.clone(),
    }
}
