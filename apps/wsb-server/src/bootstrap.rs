//! Argument records for the two bootstrap scripts.
//!
//! A configuration is bootstrapped in a separate interpreter; the only thing
//! we hand the child is a single args file holding one serialized record.
//! The refill script writes its results straight into the persistent cache
//! file named in the record; the execute script reports through the tagged
//! log channel and its exit code.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::runner::{self, RunOutput};
use crate::site::ConfigDescriptor;

/// Input record for the cache-refill script.
#[derive(Debug, Serialize)]
pub struct RefillArgs<'a> {
    pub cache_file: &'a Path,
    /// Raw client payload, passed through untouched for the engine hooks.
    pub payload: &'a Value,
    pub base_configuration_uri: &'a str,
    pub engine_name: Option<&'a str>,
    pub configurations: Vec<RefillEntry>,
    pub immutable: bool,
    pub bundle_fallback_paths: &'a [PathBuf],
    pub user_credentials: &'a Value,
}

/// Per-(configuration, entity-type) row the child must (re)write.
#[derive(Debug, Clone, Serialize)]
pub struct RefillEntry {
    pub entity: String,
    pub lookup_hash: String,
    /// Hex-encoded contents hash the child stores next to the blob.
    pub contents_hash: String,
}

/// Input record for the execute script.
#[derive(Debug, Serialize)]
pub struct ExecuteArgs<'a> {
    pub configuration: &'a Value,
    pub project: &'a Value,
    pub command_name: &'a str,
    pub entities: &'a [Value],
    pub base_configuration_uri: &'a str,
    pub engine_name: Option<&'a str>,
}

/// Serializes `record` into a uniquely named args file under `dir`. The file
/// is consumed by exactly one child and removed by [`run_script`].
fn write_args_file<T: Serialize>(dir: &Path, prefix: &str, record: &T) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "{prefix}_{}.json",
        uuid::Uuid::new_v4().simple()
    ));
    let bytes = serde_json::to_vec(record).context("serializing args record")?;
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Writes the args file, runs `script` under the configuration's
/// interpreter, and cleans the args file up regardless of outcome.
pub async fn run_script<T: Serialize>(
    config: &ConfigDescriptor,
    script: &Path,
    args_dir: &Path,
    prefix: &str,
    record: &T,
) -> Result<RunOutput> {
    let args_file = write_args_file(args_dir, prefix, record)?;
    let result = runner::run(&config.interpreter, script, &args_file).await;
    if let Err(err) = std::fs::remove_file(&args_file) {
        tracing::debug!(path = %args_file.display(), %err, "args file cleanup failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn args_file_holds_the_record() {
        let tmp = tempdir().unwrap();
        let record = RefillArgs {
            cache_file: Path::new("/tmp/cache.sqlite"),
            payload: &json!({"entity_type": "Shot"}),
            base_configuration_uri: "sgtk:descriptor:path?path=/cfg",
            engine_name: Some("tk-shotgun"),
            configurations: vec![RefillEntry {
                entity: "Shot".into(),
                lookup_hash: "abc_v2".into(),
                contents_hash: "00ff".into(),
            }],
            immutable: false,
            bundle_fallback_paths: &[PathBuf::from("/opt/bundles")],
            user_credentials: &json!({"login": "alice"}),
        };
        let path = write_args_file(tmp.path(), "refill", &record).unwrap();
        let read: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(read["base_configuration_uri"], "sgtk:descriptor:path?path=/cfg");
        assert_eq!(read["configurations"][0]["lookup_hash"], "abc_v2");
        assert_eq!(read["user_credentials"]["login"], "alice");
    }

    #[test]
    fn args_files_are_unique() {
        let tmp = tempdir().unwrap();
        let a = write_args_file(tmp.path(), "exec", &json!({})).unwrap();
        let b = write_args_file(tmp.path(), "exec", &json!({})).unwrap();
        assert_ne!(a, b);
    }
}
