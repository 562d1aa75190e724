//! Persistent action cache: a single-file sqlite key/value store shared by
//! every session of one bridge process, plus the hashing that keys it.
//!
//! The store is deliberately dumb. Rows are written either by this process
//! (engine-side upsert) or by the refill subprocess, which opens the same
//! file directly; writes are serialized above this layer by the subprocess
//! mutex, so each operation opens its own connection and relies on sqlite
//! for interleaved reads.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub mod fingerprint;

pub use fingerprint::{
    canonicalize_json, contents_hash, lookup_key, ConfigFingerprint, LOOKUP_SCHEMA_VERSION,
};

/// On-disk file name; versioned so layout changes invalidate wholesale.
pub fn cache_file_name() -> String {
    format!("shotgun_engine_commands_v{}.sqlite", LOOKUP_SCHEMA_VERSION)
}

/// One cached row: the contents hash the blob was computed against and the
/// encoded action list, verbatim as the refill subprocess wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub contents_hash: Vec<u8>,
    pub commands: Vec<u8>,
}

#[derive(Clone)]
pub struct CommandCache {
    db_path: PathBuf,
}

impl CommandCache {
    /// Opens (and creates if needed) the store under `dir`. Schema creation
    /// is idempotent; a pre-existing file with a missing table behaves as an
    /// empty cache.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(cache_file_name());
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS engine_commands (
              lookup_hash TEXT PRIMARY KEY,
              contents_hash BLOB,
              commands BLOB
            );
            "#,
        )?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // The refill subprocess may have recreated the file from scratch.
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    pub fn get(&self, lookup_hash: &str) -> Result<Option<CacheRow>> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                "SELECT contents_hash, commands FROM engine_commands WHERE lookup_hash = ?1",
                params![lookup_hash],
                |row| {
                    Ok(CacheRow {
                        contents_hash: row.get(0)?,
                        commands: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Update-then-insert, mirroring what the refill subprocess does: UPDATE
    /// first and INSERT only when no row changed, so concurrent writers of
    /// the same key converge on a single row.
    pub fn upsert(&self, lookup_hash: &str, contents_hash: &[u8], commands: &[u8]) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE engine_commands SET contents_hash = ?2, commands = ?3 WHERE lookup_hash = ?1",
            params![lookup_hash, contents_hash, commands],
        )?;
        if changed == 0 {
            conn.execute(
                "INSERT OR REPLACE INTO engine_commands (lookup_hash, contents_hash, commands)
                 VALUES (?1, ?2, ?3)",
                params![lookup_hash, contents_hash, commands],
            )?;
        }
        Ok(())
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------

    pub async fn get_async(&self, lookup_hash: &str) -> Result<Option<CacheRow>> {
        let this = self.clone();
        let key = lookup_hash.to_string();
        tokio::task::spawn_blocking(move || this.get(&key))
            .await
            .map_err(anyhow::Error::from)?
    }

    pub async fn upsert_async(
        &self,
        lookup_hash: &str,
        contents_hash: Vec<u8>,
        commands: Vec<u8>,
    ) -> Result<()> {
        let this = self.clone();
        let key = lookup_hash.to_string();
        tokio::task::spawn_blocking(move || this.upsert(&key, &contents_hash, &commands))
            .await
            .map_err(anyhow::Error::from)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn upsert_then_get_returns_exact_bytes() {
        let tmp = tempdir().unwrap();
        let cache = CommandCache::open(tmp.path()).unwrap();
        // binary-safe payload: NUL bytes and invalid UTF-8
        let blob = vec![0x00, 0xff, 0xfe, b'{', b'}', 0x00];
        let hash = vec![1u8; 16];
        cache.upsert("k1", &hash, &blob).unwrap();
        let row = cache.get("k1").unwrap().expect("row");
        assert_eq!(row.contents_hash, hash);
        assert_eq!(row.commands, blob);
    }

    #[test]
    fn upsert_updates_in_place() {
        let tmp = tempdir().unwrap();
        let cache = CommandCache::open(tmp.path()).unwrap();
        cache.upsert("k1", &[1u8; 16], b"old").unwrap();
        cache.upsert("k1", &[2u8; 16], b"new").unwrap();
        let row = cache.get("k1").unwrap().expect("row");
        assert_eq!(row.contents_hash, vec![2u8; 16]);
        assert_eq!(row.commands, b"new".to_vec());
    }

    #[test]
    fn missing_key_is_none() {
        let tmp = tempdir().unwrap();
        let cache = CommandCache::open(tmp.path()).unwrap();
        assert!(cache.get("absent").unwrap().is_none());
    }

    #[test]
    fn dropped_table_behaves_as_empty_cache() {
        let tmp = tempdir().unwrap();
        let cache = CommandCache::open(tmp.path()).unwrap();
        cache.upsert("k1", &[0u8; 16], b"blob").unwrap();
        let conn = Connection::open(cache.db_path()).unwrap();
        conn.execute_batch("DROP TABLE engine_commands;").unwrap();
        drop(conn);
        assert!(cache.get("k1").unwrap().is_none());
    }

    #[test]
    fn file_name_carries_schema_version() {
        assert_eq!(
            cache_file_name(),
            format!("shotgun_engine_commands_v{}.sqlite", LOOKUP_SCHEMA_VERSION)
        );
    }

    #[tokio::test]
    async fn async_wrappers_roundtrip() {
        let tmp = tempdir().unwrap();
        let cache = CommandCache::open(tmp.path()).unwrap();
        cache
            .upsert_async("k2", vec![9u8; 16], b"payload".to_vec())
            .await
            .unwrap();
        let row = cache.get_async("k2").await.unwrap().expect("row");
        assert_eq!(row.commands, b"payload".to_vec());
    }
}
