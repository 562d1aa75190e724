//! Site adapter: the bridge's only view of the remote web application.
//!
//! Everything the cache engine needs from the site goes through the
//! [`SiteClient`] trait so tests and offline runs can substitute a canned
//! implementation. The HTTP client is a thin REST wrapper; the site itself
//! is an external collaborator whose schema we consume, not define.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// One resolvable configuration for a project, as reported by the site's
/// configuration resolver. Opaque beyond these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub immutable: bool,
    /// Environment root scanned for descriptor files; only meaningful for
    /// mutable configurations.
    #[serde(default)]
    pub env_root: Option<PathBuf>,
    #[serde(default)]
    pub engine_name: Option<String>,
    /// Interpreter that bootstraps this configuration in a subprocess.
    pub interpreter: PathBuf,
    /// Script executed to refill the action cache.
    pub cache_script: PathBuf,
    /// Script executed to run one engine command.
    pub execute_script: PathBuf,
    #[serde(default)]
    pub bundle_fallback_paths: Vec<PathBuf>,
}

#[async_trait]
pub trait SiteClient: Send + Sync {
    /// Site-state snapshot: software/launcher entities and any other records
    /// the configurations name as hash input. Fetched once per session.
    async fn site_state(&self) -> Result<Vec<Value>>;

    /// Parent entity type of a task, `None` when the task is unlinked.
    async fn task_parent_type(&self, task_id: i64) -> Result<Option<String>>;

    /// Frame-encryption secret, fetched over the site's own authenticated
    /// channel and keyed by the server id we revealed.
    async fn websocket_secret(&self, server_id: &str) -> Result<String>;

    /// Configurations registered for a project.
    async fn configurations(&self, project_id: i64) -> Result<Vec<ConfigDescriptor>>;
}

pub struct HttpSiteClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSiteClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("site rejected {url}"))?;
        resp.json().await.with_context(|| format!("decoding {url}"))
    }
}

#[async_trait]
impl SiteClient for HttpSiteClient {
    async fn site_state(&self) -> Result<Vec<Value>> {
        let body = self.get_json("/api/v1/entity/software").await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn task_parent_type(&self, task_id: i64) -> Result<Option<String>> {
        let body = self
            .get_json(&format!("/api/v1/entity/tasks/{task_id}"))
            .await?;
        Ok(body
            .pointer("/data/entity/type")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn websocket_secret(&self, server_id: &str) -> Result<String> {
        let body = self
            .get_json(&format!("/api/v1/ws_server/secret?server_id={server_id}"))
            .await?;
        body.pointer("/data/secret")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("site reply carried no secret")
    }

    async fn configurations(&self, project_id: i64) -> Result<Vec<ConfigDescriptor>> {
        let body = self
            .get_json(&format!(
                "/api/v1/projects/{project_id}/pipeline_configurations"
            ))
            .await?;
        let rows = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        rows.into_iter()
            .map(|row| serde_json::from_value(row).context("malformed configuration record"))
            .collect()
    }
}

/// Canned site used by tests and by `--offline`-style development setups:
/// fixed snapshot, fixed task links, fixed configurations.
#[derive(Default)]
pub struct StaticSiteClient {
    pub software: Vec<Value>,
    pub task_parents: HashMap<i64, String>,
    pub secret: Option<String>,
    pub configs: Vec<ConfigDescriptor>,
    pub(crate) state_fetches: Mutex<u64>,
}

impl StaticSiteClient {
    /// Number of snapshot fetches served; lets tests assert the snapshot is
    /// fetched once per session.
    pub fn state_fetches(&self) -> u64 {
        *self.state_fetches.lock().expect("fetch counter poisoned")
    }
}

#[async_trait]
impl SiteClient for StaticSiteClient {
    async fn site_state(&self) -> Result<Vec<Value>> {
        *self.state_fetches.lock().expect("fetch counter poisoned") += 1;
        Ok(self.software.clone())
    }

    async fn task_parent_type(&self, task_id: i64) -> Result<Option<String>> {
        Ok(self.task_parents.get(&task_id).cloned())
    }

    async fn websocket_secret(&self, _server_id: &str) -> Result<String> {
        self.secret.clone().context("no secret configured")
    }

    async fn configurations(&self, _project_id: i64) -> Result<Vec<ConfigDescriptor>> {
        Ok(self.configs.clone())
    }
}
