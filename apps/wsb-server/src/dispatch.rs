//! Per-session command dispatcher.
//!
//! The endpoint hands every inbound text payload (already decrypted) to
//! [`Dispatcher::handle`], which returns the outbound text payload. Two
//! cleartext scalars bypass framing; everything else is a JSON frame routed
//! through a closed command table. The first accepted frame pins the
//! session's protocol version: version 1 sessions get their replies in
//! receive order, version 2 sessions carry correlation ids and may
//! interleave (the endpoint decides, via [`Dispatcher::pinned_version`]).

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::engine::{ExecuteRequest, GetActionsRequest};
use crate::pickers;
use crate::state::{AppState, SessionCache};
use wsb_protocol::{
    error_envelope, retcode, to_ascii_json, BridgeError, CommandFrame, COMMAND_NAMES,
    GET_PROTOCOL_VERSION, GET_WS_SERVER_ID, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};

pub struct Dispatcher {
    state: AppState,
    session: SessionCache,
    version: std::sync::Mutex<Option<u32>>,
}

impl Dispatcher {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            session: SessionCache::default(),
            version: std::sync::Mutex::new(None),
        }
    }

    /// Protocol version pinned by the first accepted frame, if any.
    pub fn pinned_version(&self) -> Option<u32> {
        *self.version.lock().expect("version lock poisoned")
    }

    /// Routes one inbound text payload to its reply. Returns `None` only for
    /// blank payloads; every real message earns exactly one reply.
    pub async fn handle(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        // Cleartext scalars, exempt from framing.
        if trimmed == GET_PROTOCOL_VERSION {
            return Some(render(&json!({ "protocol_version": PROTOCOL_VERSION })));
        }
        if trimmed == GET_WS_SERVER_ID {
            if self.state.settings().encrypt {
                return Some(render(&json!({ "ws_server_id": self.state.server_id() })));
            }
            return Some(render(&error_envelope(
                None,
                "frame encryption is not enabled on this server",
                None,
            )));
        }

        let frame: CommandFrame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "rejecting malformed frame");
                return Some(render(&error_envelope(
                    None,
                    &BridgeError::MalformedFrame(err.to_string()).to_string(),
                    None,
                )));
            }
        };
        let id = frame.id.clone();

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&frame.protocol_version) {
            return Some(render(&error_envelope(
                id.as_ref(),
                &BridgeError::UnsupportedProtocol(frame.protocol_version).to_string(),
                None,
            )));
        }
        {
            let mut pinned = self.version.lock().expect("version lock poisoned");
            match *pinned {
                None => *pinned = Some(frame.protocol_version),
                Some(v) if v != frame.protocol_version => {
                    // Tolerated; the session keeps the version it pinned.
                    warn!(pinned = v, got = frame.protocol_version, "protocol version changed mid-session");
                }
                Some(_) => {}
            }
        }

        let name = frame.command.name.clone();
        if !COMMAND_NAMES.contains(&name.as_str()) {
            return Some(render(&error_envelope(
                id.as_ref(),
                &BridgeError::UnknownCommand(name).to_string(),
                None,
            )));
        }

        let reply = self.route(&name, &frame.command.data).await;
        Some(match reply {
            Ok(mut value) => {
                if let (Some(id), Some(obj)) = (&id, value.as_object_mut()) {
                    obj.insert("id".into(), id.clone());
                }
                render(&value)
            }
            Err(err) => self.render_failure(&name, id.as_ref(), err),
        })
    }

    async fn route(&self, name: &str, data: &Value) -> Result<Value, BridgeError> {
        match name {
            "get_actions" => {
                let req: GetActionsRequest = parse_data(data)?;
                let _guard = self.state.subprocess_lock().lock().await;
                let reply = self
                    .state
                    .engine()
                    .get_actions(&self.session, &req, data)
                    .await?;
                serde_json::to_value(reply).map_err(internal)
            }
            "execute_action" => {
                let req: ExecuteRequest = parse_data(data)?;
                let _guard = self.state.subprocess_lock().lock().await;
                let reply = self.state.engine().execute_action(&req).await?;
                serde_json::to_value(reply).map_err(internal)
            }
            "open" => {
                let path = data
                    .get("filepath")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        BridgeError::MalformedFrame("open requires a 'filepath' string".into())
                    })?;
                let launcher = self.state.settings().open_launcher.clone();
                let opened = pickers::open_path(path.as_ref(), launcher.as_deref())
                    .await
                    .map_err(|e| BridgeError::CommandFailed {
                        out: String::new(),
                        err: e.to_string(),
                    })?;
                Ok(json!({ "result": opened }))
            }
            "pick_file_or_directory" => Ok(json!(pickers::pick_file_or_directory().await)),
            "pick_files_or_directories" => Ok(json!(pickers::pick_files_or_directories().await)),
            _ => Err(BridgeError::UnknownCommand(name.to_string())),
        }
    }

    /// Maps handler failures to the wire. Caching-family failures reply in
    /// the command's own shape with a retcode; framing failures reply with
    /// the error envelope.
    fn render_failure(&self, command: &str, id: Option<&Value>, err: BridgeError) -> String {
        let debug_mode = self.state.settings().debug;
        match &err {
            BridgeError::CachingError(_)
            | BridgeError::EngineInitError(_)
            | BridgeError::TaskNotLinked(_)
            | BridgeError::CachingNotCompleted
                if command == "get_actions" =>
            {
                let message = match &err {
                    BridgeError::CachingNotCompleted => {
                        "Actions are not cached yet. Please refresh and retry.".to_string()
                    }
                    other => other.to_string(),
                };
                let mut reply = json!({
                    "actions": {},
                    "pcs": [],
                    "retcode": retcode::CACHING_ERROR,
                    "err": message,
                });
                if let (Some(id), Some(obj)) = (id, reply.as_object_mut()) {
                    obj.insert("id".into(), id.clone());
                }
                render(&reply)
            }
            BridgeError::CommandFailed { out, err } => {
                let mut reply = json!({
                    "retcode": retcode::COMMAND_FAILED,
                    "out": out,
                    "err": err,
                });
                if let (Some(id), Some(obj)) = (id, reply.as_object_mut()) {
                    obj.insert("id".into(), id.clone());
                }
                render(&reply)
            }
            other => {
                let message = if debug_mode {
                    other.to_string()
                } else {
                    match other {
                        BridgeError::MalformedFrame(_)
                        | BridgeError::UnsupportedProtocol(_)
                        | BridgeError::UnknownCommand(_) => other.to_string(),
                        _ => "An unexpected error occurred. Please contact support.".to_string(),
                    }
                };
                render(&error_envelope(id, &message, None))
            }
        }
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, BridgeError> {
    serde_json::from_value(data.clone())
        .map_err(|e| BridgeError::MalformedFrame(format!("command data: {e}")))
}

fn internal(err: serde_json::Error) -> BridgeError {
    BridgeError::CachingError(format!("reply serialization failed: {err}"))
}

/// Serializes a reply as ASCII-safe JSON. Serialization of a `Value` cannot
/// fail in practice; the fallback keeps the session alive if it ever does.
fn render(value: &Value) -> String {
    to_ascii_json(value)
        .unwrap_or_else(|_| r#"{"error":true,"error_message":"reply serialization failed"}"#.into())
}
