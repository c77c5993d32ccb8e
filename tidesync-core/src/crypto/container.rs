//! Versioned binary container for encrypted sync payloads.
//!
//! The wire format is fixed:
//! `magic/version header(32) || salt(32) || iv(12) || ciphertext || auth_tag(16)`
//!
//! There are no internal length fields; everything after the fixed-size
//! prefix is ciphertext plus the trailing tag. The header is validated
//! before any crypto work so "old file, new app" surfaces as a format
//! error instead of a confusing decryption failure.

use crate::crypto::codec::{EncryptedData, IV_LEN, SALT_LEN, TAG_LEN};
use crate::crypto::{CryptoError, Result};

/// Header magic. Padded with zeroes to [`HEADER_LEN`]; the byte after the
/// magic string carries the container version.
const MAGIC: &[u8] = b"TIDESYNC:ENC";

/// Container format version.
const CONTAINER_VERSION: u8 = 1;

/// Total header length in bytes.
pub const HEADER_LEN: usize = 32;

/// Minimum container size: header + salt + iv + tag. An empty ciphertext
/// is impossible (the codec rejects empty plaintext) but the parser only
/// requires the fixed-size fields.
pub const MIN_LEN: usize = HEADER_LEN + SALT_LEN + IV_LEN + TAG_LEN;

fn build_header() -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(MAGIC);
    header[MAGIC.len()] = CONTAINER_VERSION;
    header
}

/// Serialize an encrypted payload into the container format.
pub fn serialize(data: &EncryptedData) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(HEADER_LEN + SALT_LEN + IV_LEN + data.ciphertext.len() + TAG_LEN);
    out.extend_from_slice(&build_header());
    out.extend_from_slice(&data.salt);
    out.extend_from_slice(&data.iv);
    out.extend_from_slice(&data.ciphertext);
    out.extend_from_slice(&data.auth_tag);
    out
}

/// Parse a container back into its encrypted payload.
///
/// Validates the magic bytes and container version before parsing further.
pub fn deserialize(bytes: &[u8]) -> Result<EncryptedData> {
    if bytes.len() < MIN_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "container too short: {} bytes, need at least {}",
            bytes.len(),
            MIN_LEN
        )));
    }

    if &bytes[..MAGIC.len()] != MAGIC {
        return Err(CryptoError::InvalidFormat(
            "magic bytes do not match".to_string(),
        ));
    }

    let version = bytes[MAGIC.len()];
    if version != CONTAINER_VERSION {
        return Err(CryptoError::InvalidFormat(format!(
            "unsupported container version {}",
            version
        )));
    }

    let salt_start = HEADER_LEN;
    let iv_start = salt_start + SALT_LEN;
    let body_start = iv_start + IV_LEN;
    let tag_start = bytes.len() - TAG_LEN;

    let salt: [u8; SALT_LEN] = bytes[salt_start..iv_start]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("bad salt length".to_string()))?;
    let iv: [u8; IV_LEN] = bytes[iv_start..body_start]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("bad iv length".to_string()))?;
    let auth_tag: [u8; TAG_LEN] = bytes[tag_start..]
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat("bad tag length".to_string()))?;

    Ok(EncryptedData {
        ciphertext: bytes[body_start..tag_start].to_vec(),
        iv,
        salt,
        auth_tag,
    })
}
