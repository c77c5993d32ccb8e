//! E2E Encrypted Configuration Sync
//!
//! Implements zero-knowledge device synchronization over an untrusted
//! blob store:
//! - Passphrase-encrypted full-snapshot payloads (AES-256-GCM + PBKDF2)
//! - Stable device identity and monotonic sync versioning
//! - Three-way merge against the last converged base snapshot
//! - Explicit conflict model with batch resolutions
//! - Debounced change-triggered scheduling with exponential backoff

pub mod conflict;
pub mod engine;
pub mod merge;
pub mod models;
pub mod observer;
pub mod registry;
pub mod scheduler;
pub mod settings;

pub use conflict::{Conflict, ConflictKind, ConflictResolution, ResolutionChoice};
pub use engine::{SyncEngine, SyncOutcome};
pub use models::{EntityType, SyncBase, SyncFileData, SyncMetadata};
pub use settings::SyncSettings;
