//! Device identity, sync version counter, and metadata assembly.
//!
//! All durable state goes through an injected [`StateStore`] so tests and
//! hosts supply isolated instances; nothing here is process-global.

use crate::sync::models::{ItemCounts, SyncBase, SyncMetadata, ENCRYPTION_VERSION, FORMAT_VERSION};
use crate::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

const KEY_DEVICE_ID: &str = "device_id";
const KEY_SYNC_VERSION: &str = "sync_version";
const KEY_LAST_SYNC: &str = "last_sync_time";
const KEY_SYNC_BASE: &str = "sync_base";

/// Durable string key-value persistence for the registry.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory state store for tests and ephemeral setups.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Store("state store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Store("state store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// JSON-file-backed state store. Writes go to a sibling temp file first and
/// are renamed into place so a crash never leaves a half-written file.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStateStore {
    /// Open the store, loading existing entries if the file is present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(SyncError::Store(format!("read {}: {}", path.display(), e))),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, contents)
            .map_err(|e| SyncError::Store(format!("write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| SyncError::Store(format!("rename {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Store("state store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SyncError::Store("state store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }
}

/// Static descriptors of the device running the engine.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_name: String,
    pub device_model: String,
    pub app_version: String,
}

/// Durable device identity and monotonic sync versioning.
pub struct DeviceRegistry<S: StateStore> {
    store: S,
    info: DeviceInfo,
}

impl<S: StateStore> DeviceRegistry<S> {
    pub fn new(store: S, info: DeviceInfo) -> Self {
        Self { store, info }
    }

    /// The persisted 32-hex-character device identifier. Generated once
    /// from a random UUID mixed with the device model and current time,
    /// then fixed for the device's lifetime.
    pub fn device_id(&self) -> Result<String> {
        if let Some(id) = self.store.get(KEY_DEVICE_ID)? {
            return Ok(id);
        }

        let seed = format!(
            "{}|{}|{}",
            Uuid::new_v4(),
            self.info.device_model,
            chrono::Utc::now().timestamp_millis()
        );
        let digest = hex::encode(Sha256::digest(seed.as_bytes()));
        let id = digest[..32].to_string();
        self.store.put(KEY_DEVICE_ID, &id)?;
        Ok(id)
    }

    /// The current sync version, without consuming one.
    pub fn current_sync_version(&self) -> Result<u64> {
        Ok(self
            .store
            .get(KEY_SYNC_VERSION)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Persist and return `current + 1`.
    ///
    /// Called exactly once per sync attempt, before any network I/O: a
    /// crash mid-sync still consumes the version number, so a retry can
    /// never reuse one.
    pub fn increment_sync_version(&self) -> Result<u64> {
        let next = self.current_sync_version()? + 1;
        self.store.put(KEY_SYNC_VERSION, &next.to_string())?;
        Ok(next)
    }

    /// Assemble the metadata header for the current attempt, using the
    /// already-consumed version number.
    pub fn create_sync_metadata(&self, item_counts: ItemCounts) -> Result<SyncMetadata> {
        Ok(SyncMetadata {
            device_id: self.device_id()?,
            device_name: self.info.device_name.clone(),
            device_model: self.info.device_model.clone(),
            app_version: self.info.app_version.clone(),
            sync_timestamp: chrono::Utc::now().timestamp(),
            sync_version: self.current_sync_version()?,
            format_version: FORMAT_VERSION,
            encryption_version: ENCRYPTION_VERSION,
            item_counts,
        })
    }

    /// Unix timestamp of the last successful sync, if any.
    pub fn last_sync_time(&self) -> Result<Option<i64>> {
        Ok(self
            .store
            .get(KEY_LAST_SYNC)?
            .and_then(|v| v.parse().ok()))
    }

    /// Record a successful sync at `timestamp`.
    pub fn mark_synced(&self, timestamp: i64) -> Result<()> {
        self.store.put(KEY_LAST_SYNC, &timestamp.to_string())
    }

    /// True if never synced, or the elapsed time since the last sync is at
    /// least `frequency_minutes`.
    pub fn is_sync_due(&self, frequency_minutes: u64) -> Result<bool> {
        match self.last_sync_time()? {
            None => Ok(true),
            Some(last) => {
                let elapsed = chrono::Utc::now().timestamp().saturating_sub(last);
                Ok(elapsed >= (frequency_minutes as i64) * 60)
            }
        }
    }

    /// The base snapshot from the last successful convergence.
    pub fn load_base(&self) -> Result<SyncBase> {
        match self.store.get(KEY_SYNC_BASE)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(SyncBase::default()),
        }
    }

    /// Overwrite the stored base snapshot.
    pub fn store_base(&self, base: &SyncBase) -> Result<()> {
        self.store.put(KEY_SYNC_BASE, &serde_json::to_string(base)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry<MemoryStateStore> {
        DeviceRegistry::new(
            MemoryStateStore::new(),
            DeviceInfo {
                device_name: "Test Laptop".to_string(),
                device_model: "x86_64-linux".to_string(),
                app_version: "0.3.0".to_string(),
            },
        )
    }

    #[test]
    fn device_id_is_stable_32_hex() {
        let reg = registry();
        let id1 = reg.device_id().unwrap();
        let id2 = reg.device_id().unwrap();

        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 32);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_registries_get_different_ids() {
        assert_ne!(registry().device_id().unwrap(), registry().device_id().unwrap());
    }

    #[test]
    fn sync_version_increments_by_one() {
        let reg = registry();
        assert_eq!(reg.current_sync_version().unwrap(), 0);
        assert_eq!(reg.increment_sync_version().unwrap(), 1);
        assert_eq!(reg.increment_sync_version().unwrap(), 2);
        assert_eq!(reg.current_sync_version().unwrap(), 2);
    }

    #[test]
    fn metadata_uses_current_version() {
        let reg = registry();
        reg.increment_sync_version().unwrap();
        reg.increment_sync_version().unwrap();

        let meta = reg.create_sync_metadata(ItemCounts::default()).unwrap();
        assert_eq!(meta.sync_version, 2);
        assert_eq!(meta.device_id, reg.device_id().unwrap());
        assert_eq!(meta.format_version, FORMAT_VERSION);
        assert_eq!(meta.device_name, "Test Laptop");
    }

    #[test]
    fn sync_due_when_never_synced() {
        let reg = registry();
        assert!(reg.is_sync_due(60).unwrap());

        reg.mark_synced(chrono::Utc::now().timestamp()).unwrap();
        assert!(!reg.is_sync_due(60).unwrap());

        // A last-sync far in the past is due again
        reg.mark_synced(chrono::Utc::now().timestamp() - 3601).unwrap();
        assert!(reg.is_sync_due(60).unwrap());
    }

    #[test]
    fn base_roundtrip_defaults_to_empty() {
        let reg = registry();
        assert_eq!(reg.load_base().unwrap(), SyncBase::default());

        let conns = vec![crate::sync::models::tests::sample_connection(
            "c1",
            "a.example.com",
        )];
        let base = SyncBase::capture(&conns, &[], &[], &[], &Default::default());
        reg.store_base(&base).unwrap();
        assert_eq!(reg.load_base().unwrap(), base);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync_state.json");

        {
            let store = FileStateStore::open(&path).unwrap();
            store.put("device_id", "abc123").unwrap();
            store.put("sync_version", "7").unwrap();
        }

        let store = FileStateStore::open(&path).unwrap();
        assert_eq!(store.get("device_id").unwrap().as_deref(), Some("abc123"));
        assert_eq!(store.get("sync_version").unwrap().as_deref(), Some("7"));
        assert_eq!(store.get("missing").unwrap(), None);
    }
}
