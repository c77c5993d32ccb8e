//! Tidesync Core Library
//!
//! End-to-end encrypted configuration sync for terminal clients: connection
//! profiles, SSH keys, themes, trusted-host records and preferences are
//! synchronized across devices through an untrusted blob store. The store
//! only ever sees an authenticated, passphrase-encrypted container; merging
//! and conflict handling happen on-device with a three-way merge against the
//! last converged snapshot.

pub mod crypto;
pub mod sync;

pub use crypto::{CryptoError, EncryptedData, PassphraseStrength};
pub use sync::conflict::{Conflict, ConflictKind, ConflictResolution, ResolutionChoice};
pub use sync::engine::{
    BlobTransport, LocalStore, RemoteBlob, SyncEngine, SyncOutcome, SyncStats,
};
pub use sync::merge::{CompleteMergeResult, MergeOptions, MergeResult};
pub use sync::models::{Snapshot, SyncBase, SyncFileData, SyncMetadata};
pub use sync::observer::ChangeObserver;
pub use sync::registry::{
    DeviceInfo, DeviceRegistry, FileStateStore, MemoryStateStore, StateStore,
};
pub use sync::scheduler::{
    NetworkKind, SchedulePolicy, SyncRequest, SyncScheduler, SystemConditions,
};
pub use sync::settings::SyncSettings;

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// General error type for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Unsupported sync format version {found} (this build supports up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid conflict resolution: {0}")]
    InvalidResolution(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
