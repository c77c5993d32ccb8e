//! AES-256-GCM passphrase codec for sync payloads.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key derived via PBKDF2-HMAC-SHA256 (100,000 iterations)
//! - 32-byte random salt per encryption
//! - 96-bit (12 byte) nonce, never reused for the same key
//! - 128-bit authentication tag

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use sha2::Sha256;
use zeroize::Zeroize;

/// PBKDF2-HMAC-SHA256 iteration count. Fixed by the container format;
/// changing it requires a new `encryption_version`.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;

/// Nonce length in bytes (GCM standard).
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// A symmetric key derived from the user's passphrase.
///
/// Derived fresh for every encrypt/decrypt call (the codec is stateless)
/// and zeroized on drop.
pub struct SyncKey {
    key: [u8; 32],
}

impl SyncKey {
    /// Derive a key from a passphrase and salt.
    pub fn derive(passphrase: &str, salt: &[u8; SALT_LEN]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
        Self { key }
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for SyncKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// An encrypted sync payload with its key-derivation salt and nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// Ciphertext without the trailing tag.
    pub ciphertext: Vec<u8>,

    /// Unique nonce for this payload (12 bytes).
    pub iv: [u8; IV_LEN],

    /// PBKDF2 salt (32 bytes).
    pub salt: [u8; SALT_LEN],

    /// Authentication tag (16 bytes).
    pub auth_tag: [u8; TAG_LEN],
}

/// Encrypt a plaintext payload under a passphrase.
///
/// Generates a fresh random salt and nonce for every call, so encrypting
/// the same payload twice never yields the same bytes.
pub fn encrypt(plaintext: &[u8], passphrase: &str) -> Result<EncryptedData> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot encrypt empty payload".to_string(),
        ));
    }

    let salt: [u8; SALT_LEN] = rand::random();
    let key = SyncKey::derive(passphrase, &salt);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let iv: [u8; IV_LEN] = nonce.into();

    // aes-gcm appends the tag to the ciphertext
    let ciphertext_with_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    if ciphertext_with_tag.len() < TAG_LEN {
        return Err(CryptoError::EncryptionFailed(
            "Ciphertext too short - missing auth tag".to_string(),
        ));
    }

    let tag_start = ciphertext_with_tag.len() - TAG_LEN;
    let auth_tag: [u8; TAG_LEN] = ciphertext_with_tag[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::EncryptionFailed("Invalid auth tag length".to_string()))?;
    let ciphertext = ciphertext_with_tag[..tag_start].to_vec();

    Ok(EncryptedData {
        ciphertext,
        iv,
        salt,
        auth_tag,
    })
}

/// Decrypt an encrypted payload under a passphrase.
///
/// Re-derives the key from the stored salt. A wrong passphrase and
/// tampered data are indistinguishable: both fail GCM tag verification.
pub fn decrypt(data: &EncryptedData, passphrase: &str) -> Result<Vec<u8>> {
    if data.ciphertext.is_empty() {
        return Err(CryptoError::DecryptionFailed);
    }

    let key = SyncKey::derive(passphrase, &data.salt);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from(data.iv);

    let mut ciphertext_with_tag = data.ciphertext.clone();
    ciphertext_with_tag.extend_from_slice(&data.auth_tag);

    cipher
        .decrypt(&nonce, ciphertext_with_tag.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Check whether a passphrase can open an encrypted payload.
///
/// Performs a full authenticated decrypt and discards the plaintext, so
/// passphrase-change flows can verify without handling application data.
pub fn validate_password(data: &EncryptedData, passphrase: &str) -> bool {
    decrypt(data, passphrase).is_ok()
}
