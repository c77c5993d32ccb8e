//! Sync engine: orchestrates the collect/download/decrypt/merge/resolve/
//! apply/encrypt/upload cycle.
//!
//! The merged result is computed in full before any local mutation, so an
//! abort anywhere up to the apply step leaves local data exactly as it
//! was. Single-flight is the scheduler's job; the engine assumes it is the
//! only writer of the base snapshot and version counter.

use crate::crypto;
use crate::sync::conflict::{Conflict, ConflictResolution, ConflictResolver};
use crate::sync::merge::{merge_snapshots, CompleteMergeResult, MergeOptions};
use crate::sync::models::{Snapshot, SyncFileData, FORMAT_VERSION};
use crate::sync::registry::{DeviceRegistry, StateStore};
use crate::sync::settings::SyncSettings;
use crate::{Result, SyncError};
use tracing::{debug, info};

/// A downloaded remote blob with the store's opaque version marker.
#[derive(Debug, Clone)]
pub struct RemoteBlob {
    pub bytes: Vec<u8>,
    pub version: u64,
}

/// The untrusted blob store. The engine treats the blob as opaque and
/// fully replaces it each cycle.
#[allow(async_fn_in_trait)]
pub trait BlobTransport {
    async fn download(&self) -> Result<Option<RemoteBlob>>;
    async fn upload(&self, bytes: &[u8]) -> Result<()>;
}

/// The local persisted store holding the user's collections.
#[allow(async_fn_in_trait)]
pub trait LocalStore {
    async fn load(&self) -> Result<Snapshot>;
    async fn apply(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub sync_version: u64,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Conflicts resolved last-write-wins by policy, reported for audit.
    pub auto_resolved: usize,
    /// Conflicts skipped or left unanswered; they carry to the next cycle.
    pub skipped_conflicts: usize,
    pub synced_at: i64,
}

/// Outcome of a sync attempt.
#[derive(Debug)]
pub enum SyncOutcome {
    Synced(SyncStats),
    /// The cycle paused before mutating anything; supply resolutions via
    /// [`SyncEngine::resolve_conflicts`] to complete it.
    ConflictsPending(Vec<Conflict>),
}

/// A paused cycle waiting for conflict decisions.
struct PendingSync {
    sync_version: u64,
    result: CompleteMergeResult,
    local: Snapshot,
    remote: Snapshot,
}

/// Orchestrates the full sync lifecycle against injected collaborators.
pub struct SyncEngine<T, L, S: StateStore> {
    transport: T,
    store: L,
    registry: DeviceRegistry<S>,
    settings: SyncSettings,
    pending: Option<PendingSync>,
}

impl<T: BlobTransport, L: LocalStore, S: StateStore> SyncEngine<T, L, S> {
    pub fn new(transport: T, store: L, registry: DeviceRegistry<S>, settings: SyncSettings) -> Self {
        Self {
            transport,
            store,
            registry,
            settings,
            pending: None,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry<S> {
        &self.registry
    }

    /// True when the periodic interval has elapsed (or we never synced).
    pub fn is_sync_due(&self) -> Result<bool> {
        self.registry
            .is_sync_due(self.settings.sync_frequency_minutes)
    }

    /// True when a paused cycle is waiting for resolutions.
    pub fn has_pending_conflicts(&self) -> bool {
        self.pending.is_some()
    }

    /// Abandon a paused cycle. Nothing was mutated, so this is always
    /// safe; the consumed version number stays consumed.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Run one full sync cycle.
    pub async fn sync(&mut self, passphrase: &str) -> Result<SyncOutcome> {
        self.pending = None;

        // Consume the version number first: a crash mid-cycle must never
        // reuse one
        let sync_version = self.registry.increment_sync_version()?;
        let local = self.store.load().await?;
        debug!(sync_version, "sync cycle started");

        let Some(blob) = self.transport.download().await? else {
            info!("no remote payload, performing first upload");
            let upload = self.filtered(&local);
            let stats = SyncStats {
                sync_version,
                ..Default::default()
            };
            return self.finish(None, upload, passphrase, stats).await;
        };

        debug!(blob_version = blob.version, "remote blob downloaded");
        let container = crypto::deserialize(&blob.bytes)?;
        let plaintext = crypto::decrypt(&container, passphrase)?;
        let remote_file: SyncFileData = serde_json::from_slice(&plaintext)?;

        if remote_file.metadata.format_version > FORMAT_VERSION {
            return Err(SyncError::UnsupportedVersion {
                found: remote_file.metadata.format_version,
                supported: FORMAT_VERSION,
            });
        }
        debug!(
            remote_device = %remote_file.metadata.device_id,
            remote_version = remote_file.metadata.sync_version,
            "remote payload decrypted"
        );

        let base = self.registry.load_base()?;
        let remote = remote_file.into_snapshot();
        let result = merge_snapshots(
            &self.filtered(&local),
            &self.filtered(&remote),
            &base,
            MergeOptions {
                auto_resolve: self.settings.auto_resolve_conflicts,
            },
        );

        let pending = PendingSync {
            sync_version,
            result,
            local,
            remote,
        };

        let blocking = pending.result.blocking_conflicts();
        if !blocking.is_empty() {
            info!(
                conflicts = blocking.len(),
                "sync paused awaiting conflict resolutions"
            );
            self.pending = Some(pending);
            return Ok(SyncOutcome::ConflictsPending(blocking));
        }

        self.commit(pending, passphrase).await
    }

    /// Complete a paused cycle with the caller's decisions. Skipped or
    /// unanswered conflicts keep the engine's defaults and carry forward.
    pub async fn resolve_conflicts(
        &mut self,
        resolutions: &[ConflictResolution],
        passphrase: &str,
    ) -> Result<SyncOutcome> {
        let mut pending = self.pending.take().ok_or_else(|| {
            SyncError::InvalidInput("no sync cycle is awaiting resolutions".to_string())
        })?;

        let device_id = self.registry.device_id()?;
        let unresolved = ConflictResolver::apply(&mut pending.result, resolutions, &device_id)?;
        debug!(unresolved = unresolved.len(), "resolutions applied");

        self.commit(pending, passphrase).await
    }

    /// Apply the merged result locally, then upload and record the new
    /// base. This is the commit point of the cycle.
    async fn commit(&mut self, pending: PendingSync, passphrase: &str) -> Result<SyncOutcome> {
        let result = &pending.result;
        let conflicts = result.all_conflicts();
        let stats = SyncStats {
            sync_version: pending.sync_version,
            added: result.connections.added.len()
                + result.keys.added.len()
                + result.themes.added.len()
                + result.host_keys.added.len()
                + result.preferences.added.len(),
            updated: result.connections.updated.len()
                + result.keys.updated.len()
                + result.themes.updated.len()
                + result.host_keys.updated.len()
                + result.preferences.updated.len(),
            deleted: result.connections.deleted.len()
                + result.keys.deleted.len()
                + result.themes.deleted.len()
                + result.host_keys.deleted.len()
                + result.preferences.deleted.len(),
            auto_resolved: conflicts.iter().filter(|c| c.auto_resolvable).count(),
            skipped_conflicts: conflicts.iter().filter(|c| !c.auto_resolvable).count(),
            synced_at: 0,
        };

        let merged = pending.result.merged_snapshot();
        let (apply, upload) = self.compose(merged, &pending.local, &pending.remote);

        self.store.apply(&apply).await?;

        self.finish(Some(apply), upload, passphrase, stats).await
    }

    /// Encrypt and upload the payload, then persist base and last-sync
    /// bookkeeping.
    async fn finish(
        &mut self,
        applied: Option<Snapshot>,
        upload: Snapshot,
        passphrase: &str,
        mut stats: SyncStats,
    ) -> Result<SyncOutcome> {
        // The stored base covers exactly what this device syncs: the
        // converged snapshot with disabled categories cleared
        let base = match &applied {
            Some(applied) => self.filtered(applied).capture_base(),
            None => upload.capture_base(),
        };

        let metadata = self.registry.create_sync_metadata(upload.item_counts())?;
        let payload = SyncFileData {
            metadata,
            connections: upload.connections,
            keys: upload.keys,
            themes: upload.themes,
            host_keys: upload.host_keys,
            preferences: upload.preferences,
            sync_base: base.clone(),
        };

        let bytes = serde_json::to_vec(&payload)?;
        let encrypted = crypto::encrypt(&bytes, passphrase)?;
        let wire = crypto::serialize(&encrypted);
        self.transport.upload(&wire).await?;

        let now = chrono::Utc::now().timestamp();
        self.registry.store_base(&base)?;
        self.registry.mark_synced(now)?;
        stats.synced_at = now;

        info!(
            sync_version = stats.sync_version,
            added = stats.added,
            updated = stats.updated,
            deleted = stats.deleted,
            "sync cycle committed"
        );
        Ok(SyncOutcome::Synced(stats))
    }

    /// Clear collections whose category is disabled, so they stay out of
    /// the merge and out of the base.
    fn filtered(&self, snapshot: &Snapshot) -> Snapshot {
        let s = &self.settings;
        let mut out = snapshot.clone();
        if !s.sync_connections {
            out.connections.clear();
            out.host_keys.clear();
        }
        if !s.sync_keys {
            out.keys.clear();
        }
        if !s.sync_themes {
            out.themes.clear();
        }
        if !s.sync_settings {
            out.preferences.clear();
        }
        out
    }

    /// Split the merged snapshot into what is applied locally and what is
    /// uploaded. A disabled category keeps local data untouched and passes
    /// the remote side's data through to the upload, so a partially-
    /// syncing device never erases another device's state.
    fn compose(&self, merged: Snapshot, local: &Snapshot, remote: &Snapshot) -> (Snapshot, Snapshot) {
        let s = &self.settings;
        let mut apply = merged.clone();
        let mut upload = merged;

        if !s.sync_connections {
            apply.connections = local.connections.clone();
            apply.host_keys = local.host_keys.clone();
            upload.connections = remote.connections.clone();
            upload.host_keys = remote.host_keys.clone();
        }
        if !s.sync_keys {
            apply.keys = local.keys.clone();
            upload.keys = remote.keys.clone();
        }
        if !s.sync_themes {
            apply.themes = local.themes.clone();
            upload.themes = remote.themes.clone();
        }
        if !s.sync_settings {
            apply.preferences = local.preferences.clone();
            upload.preferences = remote.preferences.clone();
        }

        (apply, upload)
    }
}
