use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Notification kinds published by the bridge.
pub mod kinds {
    /// Browser connected from a site or user the server was not started for.
    pub const DIFFERENT_USER_OR_SITE: &str = "bridge.different_user_or_site";
    /// A session completed its handshake and admission checks.
    pub const CONNECTED: &str = "bridge.connection.connected";
    /// A session closed without a clean WebSocket close frame.
    pub const CONNECTION_LOST: &str = "bridge.connection.lost";
    /// The TLS handshake failed; the served certificate is likely untrusted.
    pub const SSL_CERTIFICATE_INVALID: &str = "bridge.connection.ssl_certificate_invalid";
}

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Broadcast bus carrying connection-status transitions and one-shot
/// notifications to whatever front end is observing the bridge (tray icon,
/// desktop app, logs). Dropping every receiver is fine; publishes become
/// no-ops.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(
            kinds::DIFFERENT_USER_OR_SITE,
            &json!({"origin": "https://other.example.com", "user_id": 42}),
        );
        let env = rx.recv().await.expect("envelope");
        assert_eq!(env.kind, kinds::DIFFERENT_USER_OR_SITE);
        assert_eq!(env.payload["user_id"], 42);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = Bus::new(1);
        bus.publish(kinds::CONNECTED, &json!({"session": "abc"}));
    }
}
