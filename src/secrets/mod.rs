use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::GatewayError;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Static seed used when no operator key is configured. Fine for local
/// development, useless against anyone with a copy of the binary; set
/// `encryption_key` in production.
const DEV_FALLBACK_SEED: &str = "loopgate-dev-secret-store-seed";

/// Authenticated encryption for tenant API keys and PATs.
///
/// Ciphertext layout: IV (12 bytes) ‖ auth tag (16 bytes) ‖ payload,
/// base64-encoded for storage in TEXT columns.
pub struct SecretStore {
    cipher: Aes256Gcm,
}

impl SecretStore {
    /// Derive the AES-256 key by hashing the operator key. Falls back to a
    /// deterministic dev seed when none is supplied.
    pub fn new(operator_key: Option<&str>) -> Self {
        let seed = match operator_key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                warn!("no encryption key configured, using built-in dev seed (not safe for production)");
                DEV_FALLBACK_SEED.to_string()
            }
        };
        let key = Sha256::digest(seed.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key).expect("SHA-256 digest is a valid AES-256 key");
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, GatewayError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        // aes-gcm appends the tag to the end of the ciphertext; re-order to
        // the stored IV ‖ tag ‖ payload layout.
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::Crypto("encryption failed".into()))?;
        let (payload, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + payload.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(payload);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, GatewayError> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|_| GatewayError::Crypto("ciphertext is not valid base64".into()))?;
        if raw.len() < IV_LEN + TAG_LEN {
            return Err(GatewayError::Crypto("ciphertext too short".into()));
        }
        let (iv, rest) = raw.split_at(IV_LEN);
        let (tag, payload) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(payload.len() + TAG_LEN);
        sealed.extend_from_slice(payload);
        sealed.extend_from_slice(tag);

        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|_| GatewayError::Crypto("authentication tag mismatch".into()))?;
        String::from_utf8(plain).map_err(|_| GatewayError::Crypto("plaintext is not UTF-8".into()))
    }
}
