//! Optional symmetric envelope for WebSocket frames.
//!
//! When encryption is enabled the server mints a 128-bit id at startup and
//! reveals it via the cleartext `get_ws_server_id` scalar. The browser then
//! fetches a per-server secret from the site over its own authenticated
//! channel; both ends derive the frame key from that secret and every later
//! frame travels as AES-256-GCM ciphertext, base64-wrapped so it still fits
//! in a text frame.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use base64::Engine as _;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Mints the server id handed out by `get_ws_server_id`.
pub fn new_server_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Clone)]
pub struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    /// Derives the 32-byte frame key from the site-provided secret. SHA-256
    /// here is key stretching to a fixed width, not integrity; GCM provides
    /// the authentication.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("frame encryption failed"))?;
        let mut framed = Vec::with_capacity(NONCE_LEN + sealed.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&sealed);
        Ok(base64::engine::general_purpose::STANDARD.encode(framed))
    }

    /// Fails on anything but a well-formed ciphertext produced under the same
    /// secret; the session is closed on failure upstream.
    pub fn decrypt(&self, payload: &str) -> Result<String> {
        let framed = base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|_| anyhow!("frame is not valid base64"))?;
        if framed.len() <= NONCE_LEN {
            return Err(anyhow!("frame too short"));
        }
        let (nonce, sealed) = framed.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| anyhow!("frame failed authentication"))?;
        String::from_utf8(opened).map_err(|_| anyhow!("decrypted frame is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cipher = FrameCipher::from_secret("site-secret");
        let sealed = cipher.encrypt(r#"{"protocol_version":2}"#).unwrap();
        assert_ne!(sealed, r#"{"protocol_version":2}"#);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), r#"{"protocol_version":2}"#);
    }

    #[test]
    fn nonces_differ_between_frames() {
        let cipher = FrameCipher::from_secret("site-secret");
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_secret_fails_authentication() {
        let sealed = FrameCipher::from_secret("right").encrypt("payload").unwrap();
        assert!(FrameCipher::from_secret("wrong").decrypt(&sealed).is_err());
    }

    #[test]
    fn tampered_frame_fails() {
        let cipher = FrameCipher::from_secret("secret");
        let sealed = cipher.encrypt("payload").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(&sealed)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(cipher.decrypt(&tampered).is_err());
    }

    #[test]
    fn server_id_is_128_bit_hex() {
        let id = new_server_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
