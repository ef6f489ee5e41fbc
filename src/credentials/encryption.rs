//! Key derivation and AES-256-GCM encryption for stored records.
//!
//! The record key is derived from the operator secret with PBKDF2-HMAC-SHA256
//! and a fixed salt, so the same secret always yields the same key across
//! restarts without the key itself ever touching disk.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::config::{ConfigError, Secret};

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

const KDF_SALT: &[u8] = b"salt_";
const KDF_ITERATIONS: u32 = 100_000;

/// A 256-bit record encryption key, wiped from memory on drop.
#[derive(Clone)]
pub struct DerivedKey(Zeroizing<[u8; KEY_SIZE]>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(**redacted**)")
    }
}

/// Failures while sealing or opening a record.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    /// Wrong key, tampered ciphertext, or a record moved to another key.
    #[error("authentication failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("stored value is not valid: {0}")]
    Encoding(String),
}

/// Derives the record encryption key from the operator secret.
///
/// Deterministic: fixed salt and iteration count. Fails with
/// `ConfigError::MissingSecret` on a blank secret.
pub fn derive_key(secret: &Secret) -> Result<DerivedKey, ConfigError> {
    if secret.is_blank() {
        return Err(ConfigError::MissingSecret);
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        secret.expose().as_bytes(),
        KDF_SALT,
        KDF_ITERATIONS,
        &mut key[..],
    );

    Ok(DerivedKey(key))
}

/// Encrypts plaintext using AES-256-GCM with a random nonce.
///
/// `aad` is authenticated but not encrypted; the record store passes the
/// record key so a ciphertext only opens under the key it was written for.
///
/// Returns `(ciphertext, nonce)`, both base64-encoded.
pub fn encrypt(plaintext: &str, key: &DerivedKey, aad: &[u8]) -> Result<(String, String), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Encrypt)?;

    // Never reuse a nonce under the same key
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(
            &nonce_bytes,
            Payload {
                msg: plaintext.as_bytes(),
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    Ok((BASE64.encode(&ciphertext_bytes), BASE64.encode(nonce_bytes)))
}

/// Decrypts base64 ciphertext produced by [`encrypt`] with the same `aad`.
pub fn decrypt(ciphertext: &str, nonce: &str, key: &DerivedKey, aad: &[u8]) -> Result<String, CryptoError> {
    let ciphertext_bytes = BASE64
        .decode(ciphertext)
        .map_err(|e| CryptoError::Encoding(format!("ciphertext: {}", e)))?;
    let nonce_bytes = BASE64
        .decode(nonce)
        .map_err(|e| CryptoError::Encoding(format!("nonce: {}", e)))?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::Encoding(format!(
            "nonce: expected {} bytes, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| CryptoError::Decrypt)?;

    let plaintext_bytes = cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: ciphertext_bytes.as_ref(),
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)?;

    String::from_utf8(plaintext_bytes)
        .map_err(|_| CryptoError::Encoding("plaintext is not valid UTF-8".to_string()))
}
