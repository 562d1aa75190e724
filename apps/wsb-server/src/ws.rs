//! TLS WebSocket endpoint.
//!
//! Per connection: `tls_handshake -> origin_check -> (rejected | established)
//! -> (cleartext | encrypted) -> closed`. The endpoint owns the transport and
//! the optional frame cipher; decoded text payloads go to the dispatcher and
//! its replies come back through a writer task so concurrent version-2
//! handlers never interleave partial writes.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::crypto::FrameCipher;
use crate::dispatch::Dispatcher;
use crate::state::AppState;
use wsb_events::kinds;
use wsb_protocol::GET_WS_SERVER_ID;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("missing certificate: expected server.crt and server.key under {0}")]
    MissingCertificate(PathBuf),
    #[error("port {0} is already in use")]
    PortBusy(u16),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Endpoint {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: AppState,
}

impl Endpoint {
    /// Binds the loopback listener and loads the TLS key pair. Fails fast:
    /// a missing key pair or a busy port is fatal at startup.
    pub async fn bind(state: AppState) -> Result<Self, StartupError> {
        let keys_path = state.settings().keys_path();
        let tls = load_tls_config(&keys_path)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let port = state.settings().port;
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                return Err(StartupError::PortBusy(port));
            }
            Err(err) => return Err(StartupError::Other(err.into())),
        };
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "browser bridge listening"
        );
        Ok(Self {
            listener,
            acceptor,
            state,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the listener errors out. Each connection gets
    /// its own task and cannot take the loop down.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let acceptor = self.acceptor.clone();
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(state, acceptor, stream, peer).await {
                    debug!(%peer, %err, "session ended with error");
                }
            });
        }
    }
}

/// Reads `server.crt` / `server.key` (PEM) from `keys_path`.
fn load_tls_config(keys_path: &Path) -> Result<ServerConfig, StartupError> {
    // The dependency graph can compile in more than one rustls crypto
    // backend; pin the process-level provider before any config is built.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let cert_path = keys_path.join("server.crt");
    let key_path = keys_path.join("server.key");
    if !cert_path.exists() || !key_path.exists() {
        return Err(StartupError::MissingCertificate(keys_path.to_path_buf()));
    }

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(
        &mut std::io::BufReader::new(std::fs::File::open(&cert_path).map_err(anyhow::Error::from)?),
    )
    .collect::<Result<_, _>>()
    .map_err(|e| StartupError::Other(anyhow::anyhow!("reading {}: {e}", cert_path.display())))?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&key_path).map_err(anyhow::Error::from)?,
    ))
    .map_err(|e| StartupError::Other(anyhow::anyhow!("reading {}: {e}", key_path.display())))?
    .ok_or_else(|| StartupError::MissingCertificate(keys_path.to_path_buf()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| StartupError::Other(anyhow::anyhow!("invalid key pair: {e}")))
}

struct Handshake {
    origin: Option<String>,
    session_id: Option<String>,
    rejected: bool,
}

async fn handle_connection(
    state: AppState,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(err) => {
            // The browser aborts mid-handshake when it does not trust the
            // served certificate.
            state.bus().publish(
                kinds::SSL_CERTIFICATE_INVALID,
                &json!({ "peer": peer.to_string(), "error": err.to_string() }),
            );
            return Err(err.into());
        }
    };

    let handshake = Arc::new(Mutex::new(Handshake {
        origin: None,
        session_id: None,
        rejected: false,
    }));
    let callback_state = Arc::clone(&handshake);
    let settings = state.settings().clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let mut hs = callback_state.lock().expect("handshake state poisoned");
        hs.origin = request
            .headers()
            .get("Origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        hs.session_id = request
            .headers()
            .get("Sec-WebSocket-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let allowed = hs
            .origin
            .as_deref()
            .map(|origin| settings.origin_allowed(origin))
            .unwrap_or(false);
        if allowed {
            Ok(response)
        } else {
            hs.rejected = true;
            let mut forbidden = ErrorResponse::new(Some("origin not allowed".into()));
            *forbidden.status_mut() = StatusCode::FORBIDDEN;
            Err(forbidden)
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(tls_stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            let hs = handshake.lock().expect("handshake state poisoned");
            if hs.rejected {
                // One-shot notification for the UI: someone from another
                // site (or another login) knocked on this bridge.
                state.bus().publish(
                    kinds::DIFFERENT_USER_OR_SITE,
                    &json!({
                        "origin": hs.origin,
                        "user_id": state.settings().user_id,
                    }),
                );
                return Ok(());
            }
            return Err(err.into());
        }
    };

    let (origin, session_id) = {
        let hs = handshake.lock().expect("handshake state poisoned");
        (
            hs.origin.clone().unwrap_or_default(),
            hs.session_id.clone().unwrap_or_default(),
        )
    };
    state.bus().publish(
        kinds::CONNECTED,
        &json!({ "session_id": session_id, "origin": origin }),
    );
    info!(%peer, session_id, "session established");

    let (mut sink, mut source) = ws_stream.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = reply_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let dispatcher = Arc::new(Dispatcher::new(state.clone()));
    let cipher: Arc<Mutex<Option<FrameCipher>>> = Arc::new(Mutex::new(None));
    let mut clean_close = false;

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(%peer, %err, "transport error");
                break;
            }
        };
        match message {
            Message::Text(raw) => {
                let plaintext = {
                    let armed = cipher.lock().expect("cipher lock poisoned").clone();
                    match armed {
                        Some(cipher) => match cipher.decrypt(&raw) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(%peer, %err, "closing session on undecryptable frame");
                                break;
                            }
                        },
                        None => raw,
                    }
                };

                let arm_after_reply = state.settings().encrypt
                    && cipher.lock().expect("cipher lock poisoned").is_none()
                    && plaintext.trim() == GET_WS_SERVER_ID;

                if dispatcher.pinned_version() == Some(2) && !arm_after_reply {
                    // Version 2 replies may interleave; each frame gets its
                    // own worker.
                    let dispatcher = Arc::clone(&dispatcher);
                    let cipher = Arc::clone(&cipher);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = dispatcher.handle(&plaintext).await {
                            let message = match seal(&cipher, reply) {
                                Some(message) => message,
                                None => Message::Close(None),
                            };
                            let _ = reply_tx.send(message).await;
                        }
                    });
                } else {
                    if let Some(reply) = dispatcher.handle(&plaintext).await {
                        let Some(message) = seal(&cipher, reply) else {
                            break;
                        };
                        if reply_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    if arm_after_reply {
                        match arm_cipher(&state).await {
                            Ok(armed) => {
                                *cipher.lock().expect("cipher lock poisoned") = Some(armed);
                                debug!(%peer, "frame encryption armed");
                            }
                            Err(err) => {
                                warn!(%peer, %err, "could not fetch the frame secret; closing");
                                break;
                            }
                        }
                    }
                }
            }
            Message::Ping(payload) => {
                if reply_tx.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                clean_close = true;
                break;
            }
            _ => {}
        }
    }

    drop(reply_tx);
    let _ = writer.await;

    if !clean_close {
        state.bus().publish(
            kinds::CONNECTION_LOST,
            &json!({ "session_id": session_id, "origin": origin }),
        );
    }
    Ok(())
}

/// Encrypts a reply when the session cipher is armed. `None` means the
/// reply could not be sealed; an armed session never falls back to
/// cleartext, the caller closes instead.
fn seal(cipher: &Arc<Mutex<Option<FrameCipher>>>, reply: String) -> Option<Message> {
    let armed = cipher.lock().expect("cipher lock poisoned").clone();
    match armed {
        Some(cipher) => match cipher.encrypt(&reply) {
            Ok(sealed) => Some(Message::text(sealed)),
            Err(err) => {
                warn!(%err, "dropping a reply that failed to encrypt");
                None
            }
        },
        None => Some(Message::text(reply)),
    }
}

/// Fetches the frame secret from the site, keyed by the server id the client
/// just learned, and derives the session cipher from it.
async fn arm_cipher(state: &AppState) -> anyhow::Result<FrameCipher> {
    let secret = state.site().websocket_secret(state.server_id()).await?;
    Ok(FrameCipher::from_secret(&secret))
}
