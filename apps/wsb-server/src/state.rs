//! Process-wide and per-session state, threaded explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};

use crate::config::Settings;
use crate::crypto;
use crate::engine::ActionCacheEngine;
use crate::site::SiteClient;
use wsb_events::Bus;

/// Everything a session needs a handle on. Cloning is cheap; the genuinely
/// process-wide pieces (persistent store, pending-refill map, subprocess
/// mutex) live inside the engine and are shared through the `Arc`s here.
#[derive(Clone)]
pub struct AppState {
    bus: Bus,
    engine: Arc<ActionCacheEngine>,
    site: Arc<dyn SiteClient>,
    settings: Arc<Settings>,
    /// Revealed through `get_ws_server_id`; minted once per process.
    server_id: Arc<str>,
    /// Serializes every subprocess spawn across all sessions: the child
    /// bootstrap manipulates shared disk state and ecosystem caches. Owned
    /// by the engine so its background validators contend on the same lock.
    subprocess_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(
        bus: Bus,
        engine: Arc<ActionCacheEngine>,
        site: Arc<dyn SiteClient>,
        settings: Arc<Settings>,
    ) -> Self {
        let subprocess_lock = engine.subprocess_lock().clone();
        Self {
            bus,
            engine,
            site,
            settings,
            server_id: crypto::new_server_id().into(),
            subprocess_lock,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<ActionCacheEngine> {
        &self.engine
    }

    pub fn site(&self) -> &Arc<dyn SiteClient> {
        &self.site
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn subprocess_lock(&self) -> &Arc<Mutex<()>> {
        &self.subprocess_lock
    }
}

/// Cache namespace owned by one WebSocket connection. Never shared across
/// sessions; dropped with the connection.
#[derive(Default)]
pub struct SessionCache {
    site_state: OnceCell<Vec<Value>>,
    task_parents: Mutex<HashMap<i64, String>>,
}

impl SessionCache {
    /// Site-state snapshot, fetched from the site at most once per session.
    pub async fn site_state(&self, site: &Arc<dyn SiteClient>) -> anyhow::Result<&Vec<Value>> {
        self.site_state
            .get_or_try_init(|| async { site.site_state().await })
            .await
    }

    /// `task_id -> parent entity type`, memoized per session.
    pub async fn task_parent_type(
        &self,
        site: &Arc<dyn SiteClient>,
        task_id: i64,
    ) -> anyhow::Result<Option<String>> {
        {
            let known = self.task_parents.lock().await;
            if let Some(parent) = known.get(&task_id) {
                return Ok(Some(parent.clone()));
            }
        }
        let fetched = site.task_parent_type(task_id).await?;
        if let Some(parent) = &fetched {
            self.task_parents
                .lock()
                .await
                .insert(task_id, parent.clone());
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::StaticSiteClient;
    use serde_json::json;

    #[tokio::test]
    async fn site_state_is_fetched_once_per_session() {
        let site = Arc::new(StaticSiteClient {
            software: vec![json!({"id": 1})],
            ..Default::default()
        });
        let dyn_site: Arc<dyn SiteClient> = site.clone();
        let session = SessionCache::default();
        session.site_state(&dyn_site).await.unwrap();
        session.site_state(&dyn_site).await.unwrap();
        assert_eq!(site.state_fetches(), 1);
    }

    #[tokio::test]
    async fn task_parent_is_memoized() {
        let site = Arc::new(StaticSiteClient {
            task_parents: HashMap::from([(7, "Shot".to_string())]),
            ..Default::default()
        });
        let dyn_site: Arc<dyn SiteClient> = site;
        let session = SessionCache::default();
        assert_eq!(
            session.task_parent_type(&dyn_site, 7).await.unwrap(),
            Some("Shot".into())
        );
        assert_eq!(
            session.task_parent_type(&dyn_site, 8).await.unwrap(),
            None
        );
    }
}
