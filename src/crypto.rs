//! Symmetric encryption for credentials held on user records.
//!
//! Values are sealed with AES-256-GCM under a key derived from the
//! process-wide secret via HKDF-SHA256. The stored form is
//! `enc:v1:<base64(nonce || ciphertext)>`.

use aes_gcm::aead::Aead;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{Aes256Gcm, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;
const HKDF_SALT: &[u8] = b"alice-credential-store";
const HKDF_INFO: &[u8] = b"aes-256-gcm";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Seals and opens credential strings.
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    /// Derive the encryption key from the process secret.
    pub fn new(secret: &SecretString) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.expose_secret().as_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;

        Ok(Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(&key)),
        })
    }

    /// Encrypt a value. Empty input stays empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(format!("{}{}", ENVELOPE_PREFIX, BASE64.encode(sealed)))
    }

    /// Decrypt a stored value.
    ///
    /// Values without the envelope prefix are legacy plaintext and are
    /// returned unchanged.
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let Some(encoded) = stored.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(stored.to_string());
        };

        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt("envelope too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt("authentication failed".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }
}
