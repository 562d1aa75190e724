//! Wire types for the browser bridge.
//!
//! Every application frame is a UTF-8 JSON object; two cleartext scalars
//! (`get_protocol_version`, `get_ws_server_id`) bypass framing so that a
//! client can discover the protocol before it speaks it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u32 = 2;

/// Versions the dispatcher will admit. Version 1 clients get strictly
/// ordered replies and the modern command table; the legacy v1 command
/// superset is not exposed.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[u32] = &[1, 2];

/// Unframed scalar: protocol discovery.
pub const GET_PROTOCOL_VERSION: &str = "get_protocol_version";
/// Unframed scalar: reveals the server id when frame encryption is enabled.
pub const GET_WS_SERVER_ID: &str = "get_ws_server_id";

/// Return codes carried in command replies.
pub mod retcode {
    pub const SUCCESS: i64 = 0;
    pub const COMMAND_FAILED: i64 = 1;
    pub const UNSUPPORTED: i64 = 2;
    pub const CACHING_ERROR: i64 = 3;
}

/// Names the dispatcher routes. Anything else earns an error envelope.
pub const COMMAND_NAMES: &[&str] = &[
    "get_actions",
    "execute_action",
    "open",
    "pick_file_or_directory",
    "pick_files_or_directories",
];

/// One framed request from the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    /// Correlation id, echoed on the reply when present (v2 clients).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub protocol_version: u32,
    pub command: CommandPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// One invokable engine command as registered by a configuration. Opaque to
/// the bridge beyond these fields; the filter in the server only reads
/// `engine_name` and `software_entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub deny_permissions: Vec<String>,
    #[serde(default)]
    pub supports_multiple_selection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_default: Option<bool>,
    #[serde(default)]
    pub engine_name: Option<String>,
    /// Tri-state: absent (legacy action, matched by engine name), explicit
    /// `null` (not tied to a software entity, always passes the project
    /// filter), or a software entity id.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub software_entity_id: Option<Option<i64>>,
}

/// Keeps explicit `null` distinguishable from an absent key: `null` becomes
/// `Some(None)` instead of collapsing into `None`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

/// Actions resolved for one configuration, keyed by configuration name in
/// the `get_actions` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigActions {
    pub config: Value,
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetActionsReply {
    pub actions: Map<String, Value>,
    /// Pipeline configuration entities consulted for the reply.
    pub pcs: Vec<String>,
    pub retcode: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteActionReply {
    pub retcode: i64,
    pub out: String,
    pub err: String,
}

/// Typed failures surfaced by command handlers. The dispatcher maps these to
/// user-facing envelopes; none of them terminate the session.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u32),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("action caching failed: {0}")]
    CachingError(String),
    #[error("configuration bootstrap failed: {0}")]
    EngineInitError(String),
    #[error("command failed")]
    CommandFailed { out: String, err: String },
    #[error("task {0} is not linked to an entity")]
    TaskNotLinked(String),
    #[error("actions are not cached yet; retry once the selection exists")]
    CachingNotCompleted,
}

/// Builds the failure envelope sent in place of a handler reply. The request
/// id, when known, is copied so v2 clients can correlate.
pub fn error_envelope(id: Option<&Value>, message: &str, data: Option<Value>) -> Value {
    let mut out = json!({
        "error": true,
        "error_message": message,
    });
    if let Some(data) = data {
        out["error_data"] = data;
    }
    if let Some(id) = id {
        out["id"] = id.clone();
    }
    out
}

/// Serializes a value as ASCII-safe JSON: every non-ASCII scalar is escaped
/// as `\uXXXX` so the text frame survives transport layers with broken
/// charset handling. serde_json only emits non-ASCII inside string literals,
/// so a character-level pass over the rendered output is sufficient.
pub fn to_ascii_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let rendered = serde_json::to_string(value)?;
    if rendered.is_ascii() {
        return Ok(rendered);
    }
    let mut out = String::with_capacity(rendered.len() + 16);
    for ch in rendered.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}
