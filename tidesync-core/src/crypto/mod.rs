//! Cryptographic primitives for the sync payload.
//!
//! This module provides:
//! - PBKDF2-HMAC-SHA256 key derivation
//! - AES-256-GCM encryption/decryption
//! - The versioned binary container format
//! - Passphrase strength classification

pub mod codec;
pub mod container;
pub mod strength;

pub use codec::{decrypt, encrypt, validate_password, EncryptedData, SyncKey};
pub use container::{deserialize, serialize};
pub use strength::{classify_passphrase, PassphraseStrength};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed - wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("Unrecognized container format: {0}")]
    InvalidFormat(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
