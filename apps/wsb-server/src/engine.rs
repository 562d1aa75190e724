//! Action cache engine.
//!
//! For a (configuration, entity type, entity ids) triple this returns the
//! actions the configuration would register when freshly bootstrapped,
//! without paying the bootstrap cost on every call:
//!
//! * hit: reply synchronously from the persistent store, then revalidate in
//!   the background (debounced per lookup key);
//! * stale: serve the old blob once, refill asynchronously; the next request
//!   after the validator completes sees the new blob (monotone read per key);
//! * miss: refill synchronously, re-read, reply;
//! * cold-key stampede: the pending-refill map guarantees a single
//!   subprocess spawn; followers observe the leader's row.
//!
//! The subprocess mutex is held by the dispatcher around the synchronous
//! paths; background validators take it themselves before spawning.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bootstrap::{self, RefillArgs, RefillEntry};
use crate::filter::filter_actions;
use crate::runner::RunStatus;
use crate::singleflight::{PendingRefills, ValidatorDebounce};
use crate::site::{ConfigDescriptor, SiteClient};
use crate::state::SessionCache;
use wsb_cache::{contents_hash, lookup_key, CommandCache, ConfigFingerprint};
use wsb_protocol::{retcode, Action, BridgeError, ExecuteActionReply, GetActionsReply};

/// A stale key is revalidated at most once per interval, process-wide.
const DEFAULT_VALIDATION_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound a follower waits for the leader's refill before re-reading.
const REFILL_FOLLOW_WAIT: Duration = Duration::from_secs(180);

fn validation_interval() -> Duration {
    std::env::var("WSB_CACHE_VALIDATION_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_VALIDATION_INTERVAL)
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetActionsRequest {
    pub project_id: i64,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub entity_ids: Vec<i64>,
    /// Configuration names to consult; empty means every configuration the
    /// site reports for the project.
    #[serde(default)]
    pub configurations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub project_id: i64,
    #[serde(default)]
    pub project: Value,
    pub configuration: String,
    pub name: String,
    #[serde(default)]
    pub entities: Vec<Value>,
}

pub struct ActionCacheEngine {
    store: CommandCache,
    site: Arc<dyn SiteClient>,
    flights: PendingRefills,
    debounce: ValidatorDebounce,
    subprocess_lock: Arc<Mutex<()>>,
    args_dir: PathBuf,
    /// Serialized user credentials forwarded to refill children.
    credentials: Value,
    validators: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ActionCacheEngine {
    pub fn new(
        store: CommandCache,
        site: Arc<dyn SiteClient>,
        args_dir: PathBuf,
        credentials: Value,
    ) -> Self {
        Self {
            store,
            site,
            flights: PendingRefills::default(),
            debounce: ValidatorDebounce::new(validation_interval()),
            subprocess_lock: Arc::new(Mutex::new(())),
            args_dir,
            credentials,
            validators: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Shared with the dispatcher, which holds it across `get_actions` and
    /// `execute_action`.
    pub fn subprocess_lock(&self) -> &Arc<Mutex<()>> {
        &self.subprocess_lock
    }

    /// Awaits every background validator spawned so far. Called on shutdown
    /// and by tests asserting the monotone-read guarantee.
    pub async fn drain_validators(&self) {
        let handles: Vec<_> = {
            let mut validators = self.validators.lock().expect("validator list poisoned");
            validators.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn get_actions(
        self: &Arc<Self>,
        session: &SessionCache,
        req: &GetActionsRequest,
        payload: &Value,
    ) -> Result<GetActionsReply, BridgeError> {
        if req.entity_type.is_empty() || req.entity_ids.is_empty() {
            return Err(BridgeError::CachingNotCompleted);
        }
        let site_state = session
            .site_state(&self.site)
            .await
            .map_err(caching)?
            .clone();
        let mut configs = self
            .site
            .configurations(req.project_id)
            .await
            .map_err(caching)?;
        if !req.configurations.is_empty() {
            configs.retain(|c| req.configurations.contains(&c.name));
        }

        let parent = if req.entity_type == "Task" {
            let task_id = req.entity_ids[0];
            match session
                .task_parent_type(&self.site, task_id)
                .await
                .map_err(caching)?
            {
                Some(parent) => Some(parent),
                None => return Err(BridgeError::TaskNotLinked(task_id.to_string())),
            }
        } else {
            None
        };

        let mut actions_map = Map::new();
        let mut pcs = Vec::new();
        for config in &configs {
            let actions = self
                .actions_for_config(
                    config,
                    &req.entity_type,
                    parent.as_deref(),
                    &site_state,
                    payload,
                    req.project_id,
                )
                .await?;
            pcs.push(config.name.clone());
            let config_value = serde_json::to_value(config).map_err(|e| caching(e.into()))?;
            actions_map.insert(
                config.name.clone(),
                json!({"config": config_value, "actions": actions}),
            );
        }

        Ok(GetActionsReply {
            actions: actions_map,
            pcs,
            retcode: retcode::SUCCESS,
            err: None,
        })
    }

    async fn actions_for_config(
        self: &Arc<Self>,
        config: &ConfigDescriptor,
        entity_type: &str,
        parent: Option<&str>,
        site_state: &[Value],
        payload: &Value,
        project_id: i64,
    ) -> Result<Vec<Action>, BridgeError> {
        let fingerprint = self.fingerprint(config).await?;
        let key = lookup_key(&config.uri, entity_type, parent);
        let fresh = contents_hash(site_state, &fingerprint);

        if let Some(row) = self.store.get_async(&key).await.map_err(caching)? {
            match serde_json::from_slice::<Vec<Action>>(&row.commands) {
                Ok(actions) => {
                    if row.contents_hash != fresh {
                        self.spawn_validator(config.clone(), entity_type.to_string(), key, fresh, payload.clone());
                    }
                    return Ok(filter_actions(actions, site_state, project_id));
                }
                Err(err) => {
                    // Undecodable blob: fall through to a synchronous refill.
                    warn!(%err, key, "cached action blob failed to decode");
                }
            }
        }

        self.refill_and_reread(config, entity_type, &key, fresh, payload, site_state, project_id)
            .await
    }

    /// Miss path. Leader refills synchronously; followers wait for the
    /// leader then re-read the store instead of spawning.
    #[allow(clippy::too_many_arguments)]
    async fn refill_and_reread(
        self: &Arc<Self>,
        config: &ConfigDescriptor,
        entity_type: &str,
        key: &str,
        fresh: [u8; 16],
        payload: &Value,
        site_state: &[Value],
        project_id: i64,
    ) -> Result<Vec<Action>, BridgeError> {
        {
            let mut flight = self.flights.begin(key);
            if flight.is_leader() {
                let outcome = self.run_refill(config, entity_type, key, fresh, payload).await;
                flight.finish();
                match outcome {
                    Ok(()) => {}
                    Err(BridgeError::EngineInitError(msg)) => {
                        // This configuration failed to bootstrap; it reports
                        // an empty list while the others proceed.
                        warn!(config = %config.name, %msg, "configuration bootstrap failed");
                        return Ok(Vec::new());
                    }
                    Err(err) => return Err(err),
                }
            } else {
                debug!(key, "joining in-flight refill");
                let _ = tokio::time::timeout(REFILL_FOLLOW_WAIT, flight.wait()).await;
            }
        }

        match self.store.get_async(key).await.map_err(caching)? {
            Some(row) => match serde_json::from_slice::<Vec<Action>>(&row.commands) {
                Ok(actions) => Ok(filter_actions(actions, site_state, project_id)),
                Err(err) => {
                    warn!(%err, key, "refilled blob failed to decode");
                    Ok(Vec::new())
                }
            },
            None => {
                debug!(key, "lookup key still missing after refill");
                Ok(Vec::new())
            }
        }
    }

    /// Spawns the refill subprocess and maps its exit code. Callers hold the
    /// pending-refill leadership; synchronous callers also hold the
    /// subprocess mutex (via the dispatcher).
    async fn run_refill(
        &self,
        config: &ConfigDescriptor,
        entity_type: &str,
        key: &str,
        fresh: [u8; 16],
        payload: &Value,
    ) -> Result<(), BridgeError> {
        let args = RefillArgs {
            cache_file: self.store.db_path(),
            payload,
            base_configuration_uri: &config.uri,
            engine_name: config.engine_name.as_deref(),
            configurations: vec![RefillEntry {
                entity: entity_type.to_string(),
                lookup_hash: key.to_string(),
                contents_hash: hex_string(&fresh),
            }],
            immutable: config.immutable,
            bundle_fallback_paths: &config.bundle_fallback_paths,
            user_credentials: &self.credentials,
        };
        let output = bootstrap::run_script(config, &config.cache_script, &self.args_dir, "refill", &args)
            .await
            .map_err(caching)?;
        match output.status() {
            RunStatus::Success => Ok(()),
            RunStatus::EngineInitError => Err(BridgeError::EngineInitError(
                non_empty_or(output.filtered_stdout(), "engine initialization failed"),
            )),
            RunStatus::UnresolvedEnvironment => Err(BridgeError::EngineInitError(
                non_empty_or(output.filtered_stdout(), "configuration environment could not be resolved"),
            )),
            RunStatus::Failed(code) => Err(BridgeError::CachingError(format!(
                "refill subprocess exited with code {code}"
            ))),
        }
    }

    /// Hit-path revalidation: re-checks the stored hash and refills when it
    /// no longer matches. Debounced per lookup key across all sessions.
    fn spawn_validator(
        self: &Arc<Self>,
        config: ConfigDescriptor,
        entity_type: String,
        key: String,
        fresh: [u8; 16],
        payload: Value,
    ) {
        if !self.debounce.try_acquire(&key) {
            debug!(key, "validator debounced");
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match this.store.get_async(&key).await {
                Ok(Some(row)) if row.contents_hash == fresh => return,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, key, "validator could not read the store");
                    return;
                }
            }
            let mut flight = this.flights.begin(&key);
            if !flight.is_leader() {
                // someone else is already refilling this key
                return;
            }
            let _guard = this.subprocess_lock.lock().await;
            match this
                .run_refill(&config, &entity_type, &key, fresh, &payload)
                .await
            {
                Ok(()) => debug!(key, "validator refreshed stale entry"),
                Err(err) => warn!(%err, key, "validator refill failed"),
            }
            flight.finish();
        });
        self.track_validator(handle);
    }

    /// Keeps the validator list bounded on a long-lived server: completed
    /// handles are reaped every time a new one is tracked.
    fn track_validator(&self, handle: JoinHandle<()>) {
        let mut validators = self.validators.lock().expect("validator list poisoned");
        validators.retain(|tracked| !tracked.is_finished());
        validators.push(handle);
    }

    pub async fn execute_action(
        &self,
        req: &ExecuteRequest,
    ) -> Result<ExecuteActionReply, BridgeError> {
        let configs = self
            .site
            .configurations(req.project_id)
            .await
            .map_err(caching)?;
        let config = configs
            .into_iter()
            .find(|c| c.name == req.configuration)
            .ok_or_else(|| {
                BridgeError::CachingError(format!("unknown configuration '{}'", req.configuration))
            })?;
        let config_value = serde_json::to_value(&config).map_err(|e| caching(e.into()))?;
        let args = bootstrap::ExecuteArgs {
            configuration: &config_value,
            project: &req.project,
            command_name: &req.name,
            entities: &req.entities,
            base_configuration_uri: &config.uri,
            engine_name: config.engine_name.as_deref(),
        };
        let script = config.execute_script.clone();
        let output = bootstrap::run_script(&config, &script, &self.args_dir, "execute", &args)
            .await
            .map_err(caching)?;
        match output.status() {
            RunStatus::Success => Ok(ExecuteActionReply {
                retcode: retcode::SUCCESS,
                out: output.filtered_stdout(),
                err: output.filtered_stderr(),
            }),
            status => {
                debug!(?status, command = %req.name, "execute subprocess failed");
                Ok(ExecuteActionReply {
                    retcode: retcode::COMMAND_FAILED,
                    out: String::new(),
                    err: join_non_empty(output.filtered_stdout(), output.filtered_stderr()),
                })
            }
        }
    }

    async fn fingerprint(&self, config: &ConfigDescriptor) -> Result<ConfigFingerprint, BridgeError> {
        if config.immutable {
            return Ok(ConfigFingerprint::immutable(&config.uri));
        }
        let Some(env_root) = config.env_root.clone() else {
            // nothing to scan; behaves like an immutable configuration
            return Ok(ConfigFingerprint::immutable(&config.uri));
        };
        let uri = config.uri.clone();
        tokio::task::spawn_blocking(move || ConfigFingerprint::mutable(uri, &env_root))
            .await
            .map_err(|e| caching(e.into()))
    }
}

fn caching(err: anyhow::Error) -> BridgeError {
    BridgeError::CachingError(err.to_string())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn non_empty_or(text: String, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

fn join_non_empty(out: String, err: String) -> String {
    match (out.trim().is_empty(), err.trim().is_empty()) {
        (false, false) => format!("{out}\n{err}"),
        (false, true) => out,
        (true, false) => err,
        (true, true) => String::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::site::StaticSiteClient;
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;
    use wsb_protocol::Action;

    const URI: &str = "sgtk:descriptor:app_store?name=tk-config-basic";

    fn snapshot() -> Vec<Value> {
        vec![json!({"type": "Software", "id": 1, "engine": "tk-maya", "projects": []})]
    }

    fn action_named(name: &str) -> Action {
        Action {
            name: name.into(),
            title: name.into(),
            deny_permissions: Vec::new(),
            supports_multiple_selection: false,
            app_name: None,
            group: None,
            group_default: None,
            engine_name: None,
            software_entity_id: None,
        }
    }

    fn blob(names: &[&str]) -> Vec<u8> {
        let actions: Vec<Action> = names.iter().map(|n| action_named(n)).collect();
        serde_json::to_vec(&actions).unwrap()
    }

    fn shot_request() -> GetActionsRequest {
        GetActionsRequest {
            project_id: 7,
            entity_type: "Shot".into(),
            entity_ids: vec![101],
            configurations: Vec::new(),
        }
    }

    enum Seed<'a> {
        None,
        /// Row whose contents hash matches the live snapshot.
        Fresh(&'a [u8]),
        /// Row written against an outdated snapshot.
        Stale(&'a [u8]),
    }

    struct Rig {
        tmp: TempDir,
        engine: Arc<ActionCacheEngine>,
        store: CommandCache,
        key: String,
        fresh: [u8; 16],
    }

    impl Rig {
        /// Script bodies may refer to `{log}`, `{cache}` and `{prepared}`.
        /// `prepared` is a second store holding `names` under the fresh hash,
        /// standing in for what a real refill child would write.
        fn new(refill_body: &str, execute_body: &str, seed: Seed<'_>, prepared: &[&str]) -> Self {
            let tmp = TempDir::new().unwrap();
            let store = CommandCache::open(&tmp.path().join("cache")).unwrap();
            let fingerprint = ConfigFingerprint::immutable(URI);
            let key = lookup_key(URI, "Shot", None);
            let fresh = contents_hash(&snapshot(), &fingerprint);

            match seed {
                Seed::None => {}
                Seed::Fresh(commands) => store.upsert(&key, &fresh, commands).unwrap(),
                Seed::Stale(commands) => store.upsert(&key, &[0u8; 16], commands).unwrap(),
            }

            let prepared_store = CommandCache::open(&tmp.path().join("prepared")).unwrap();
            prepared_store
                .upsert(&key, &fresh, &blob(prepared))
                .unwrap();

            let log = tmp.path().join("spawns.log");
            let expand = |body: &str| {
                body.replace("{log}", &log.display().to_string())
                    .replace("{cache}", &store.db_path().display().to_string())
                    .replace("{prepared}", &prepared_store.db_path().display().to_string())
            };
            let refill = write_script(tmp.path(), "refill.sh", &expand(refill_body));
            let execute = write_script(tmp.path(), "execute.sh", &expand(execute_body));

            let site = Arc::new(StaticSiteClient {
                software: snapshot(),
                configs: vec![ConfigDescriptor {
                    name: "Primary".into(),
                    uri: URI.into(),
                    immutable: true,
                    env_root: None,
                    engine_name: None,
                    interpreter: "/bin/sh".into(),
                    cache_script: refill,
                    execute_script: execute,
                    bundle_fallback_paths: Vec::new(),
                }],
                task_parents: std::collections::HashMap::new(),
                secret: None,
                state_fetches: Default::default(),
            });
            let engine = Arc::new(ActionCacheEngine::new(
                store.clone(),
                site,
                tmp.path().join("args"),
                json!({"login": "alice"}),
            ));
            Self {
                tmp,
                engine,
                store,
                key,
                fresh,
            }
        }

        fn spawn_count(&self) -> usize {
            std::fs::read_to_string(self.tmp.path().join("spawns.log"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        path
    }

    fn names_for(reply: &GetActionsReply, config: &str) -> Vec<String> {
        reply.actions[config]["actions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn hit_replies_from_store_without_spawning() {
        let rig = Rig::new(
            "echo spawn >> {log}\nexit 1",
            "exit 0",
            Seed::Fresh(&blob(&["publish"])),
            &[],
        );
        let session = SessionCache::default();
        let reply = rig
            .engine
            .get_actions(&session, &shot_request(), &json!({}))
            .await
            .unwrap();
        assert_eq!(reply.retcode, retcode::SUCCESS);
        assert_eq!(reply.pcs, vec!["Primary".to_string()]);
        assert_eq!(names_for(&reply, "Primary"), vec!["publish"]);
        rig.engine.drain_validators().await;
        assert_eq!(rig.spawn_count(), 0);
    }

    #[tokio::test]
    async fn miss_refills_synchronously() {
        let rig = Rig::new(
            "echo spawn >> {log}\ncp {prepared} {cache}",
            "exit 0",
            Seed::None,
            &["launch_maya"],
        );
        let session = SessionCache::default();
        let reply = rig
            .engine
            .get_actions(&session, &shot_request(), &json!({}))
            .await
            .unwrap();
        assert_eq!(names_for(&reply, "Primary"), vec!["launch_maya"]);
        assert_eq!(rig.spawn_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_spawn_one_refill() {
        let rig = Rig::new(
            "echo spawn >> {log}\nsleep 0.5\ncp {prepared} {cache}",
            "exit 0",
            Seed::None,
            &["launch_maya"],
        );
        let a = {
            let engine = Arc::clone(&rig.engine);
            tokio::spawn(async move {
                let session = SessionCache::default();
                engine
                    .get_actions(&session, &shot_request(), &json!({}))
                    .await
            })
        };
        let b = {
            let engine = Arc::clone(&rig.engine);
            tokio::spawn(async move {
                let session = SessionCache::default();
                engine
                    .get_actions(&session, &shot_request(), &json!({}))
                    .await
            })
        };
        let (a, b) = tokio::join!(a, b);
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
        assert_eq!(names_for(&a, "Primary"), vec!["launch_maya"]);
        assert_eq!(names_for(&b, "Primary"), vec!["launch_maya"]);
        assert_eq!(rig.spawn_count(), 1);
    }

    #[tokio::test]
    async fn stale_row_is_served_then_refreshed() {
        let rig = Rig::new(
            "echo spawn >> {log}\ncp {prepared} {cache}",
            "exit 0",
            Seed::Stale(&blob(&["old_action"])),
            &["new_action"],
        );
        let session = SessionCache::default();
        let first = rig
            .engine
            .get_actions(&session, &shot_request(), &json!({}))
            .await
            .unwrap();
        assert_eq!(names_for(&first, "Primary"), vec!["old_action"]);

        rig.engine.drain_validators().await;
        assert_eq!(rig.spawn_count(), 1);
        let row = rig.store.get(&rig.key).unwrap().expect("refreshed row");
        assert_eq!(row.contents_hash, rig.fresh);

        let second = rig
            .engine
            .get_actions(&session, &shot_request(), &json!({}))
            .await
            .unwrap();
        assert_eq!(names_for(&second, "Primary"), vec!["new_action"]);
        rig.engine.drain_validators().await;
        assert_eq!(rig.spawn_count(), 1);
    }

    #[tokio::test]
    async fn finished_validators_are_reaped() {
        let rig = Rig::new("exit 0", "exit 0", Seed::None, &[]);
        rig.engine.track_validator(tokio::spawn(async {}));
        // Let the first task run to completion before tracking the next.
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.engine.track_validator(tokio::spawn(async {}));
        let tracked = rig
            .engine
            .validators
            .lock()
            .expect("validator list poisoned")
            .len();
        assert_eq!(tracked, 1);
        rig.engine.drain_validators().await;
    }

    #[tokio::test]
    async fn unlinked_task_is_rejected() {
        let rig = Rig::new("exit 0", "exit 0", Seed::None, &[]);
        let session = SessionCache::default();
        let req = GetActionsRequest {
            entity_type: "Task".into(),
            entity_ids: vec![42],
            ..shot_request()
        };
        let err = rig
            .engine
            .get_actions(&session, &req, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TaskNotLinked(id) if id == "42"));
    }

    #[tokio::test]
    async fn empty_selection_is_not_cached_yet() {
        let rig = Rig::new("exit 0", "exit 0", Seed::None, &[]);
        let session = SessionCache::default();
        let req = GetActionsRequest {
            entity_ids: Vec::new(),
            ..shot_request()
        };
        let err = rig
            .engine
            .get_actions(&session, &req, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::CachingNotCompleted));
    }

    #[tokio::test]
    async fn bootstrap_failure_yields_empty_config() {
        let rig = Rig::new("exit 77", "exit 0", Seed::None, &[]);
        let session = SessionCache::default();
        let reply = rig
            .engine
            .get_actions(&session, &shot_request(), &json!({}))
            .await
            .unwrap();
        assert_eq!(reply.retcode, retcode::SUCCESS);
        assert!(names_for(&reply, "Primary").is_empty());
    }

    #[tokio::test]
    async fn refill_crash_surfaces_as_caching_error() {
        let rig = Rig::new("exit 3", "exit 0", Seed::None, &[]);
        let session = SessionCache::default();
        let err = rig
            .engine
            .get_actions(&session, &shot_request(), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::CachingError(_)));
    }

    fn execute_request(name: &str) -> ExecuteRequest {
        ExecuteRequest {
            project_id: 7,
            project: json!({"id": 7}),
            configuration: "Primary".into(),
            name: name.into(),
            entities: vec![json!({"type": "Shot", "id": 101})],
        }
    }

    #[tokio::test]
    async fn execute_reports_tagged_output() {
        // aGVsbG8= is "hello"
        let rig = Rig::new(
            "exit 0",
            "printf 'BRIDGE_LOG64:aGVsbG8=\\n'\nexit 0",
            Seed::None,
            &[],
        );
        let reply = rig
            .engine
            .execute_action(&execute_request("publish"))
            .await
            .unwrap();
        assert_eq!(reply.retcode, retcode::SUCCESS);
        assert_eq!(reply.out, "hello");
        assert_eq!(reply.err, "");
    }

    #[tokio::test]
    async fn execute_failure_carries_stderr_logs() {
        // b29wcw== is "oops"
        let rig = Rig::new(
            "exit 0",
            "printf 'BRIDGE_LOG64:b29wcw==\\n' >&2\nexit 1",
            Seed::None,
            &[],
        );
        let reply = rig
            .engine
            .execute_action(&execute_request("publish"))
            .await
            .unwrap();
        assert_eq!(reply.retcode, retcode::COMMAND_FAILED);
        assert_eq!(reply.out, "");
        assert_eq!(reply.err, "oops");
    }

    #[tokio::test]
    async fn execute_rejects_unknown_configuration() {
        let rig = Rig::new("exit 0", "exit 0", Seed::None, &[]);
        let mut req = execute_request("publish");
        req.configuration = "Secondary".into();
        let err = rig.engine.execute_action(&req).await.unwrap_err();
        assert!(matches!(err, BridgeError::CachingError(_)));
    }
}
