//! Sync data models: payload snapshot, metadata, base snapshot, entities.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Payload schema version. A remote payload with a higher version aborts
/// the cycle before merging.
pub const FORMAT_VERSION: u32 = 1;

/// Encryption scheme version (PBKDF2-HMAC-SHA256/100k + AES-256-GCM).
pub const ENCRYPTION_VERSION: u32 = 1;

/// Type of syncable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Connection,
    SshKey,
    Theme,
    HostKey,
    Preference,
}

impl EntityType {
    /// Convert the entity type to its string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::SshKey => "ssh_key",
            Self::Theme => "theme",
            Self::HostKey => "host_key",
            Self::Preference => "preference",
        }
    }
}

/// Per-collection item counts recorded in the metadata header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub connections: usize,
    pub keys: usize,
    pub themes: usize,
    pub host_keys: usize,
    pub preferences: usize,
}

/// Provenance header for one sync attempt. Immutable once written into a
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Stable 32-hex-character device identifier.
    pub device_id: String,
    pub device_name: String,
    pub device_model: String,
    pub app_version: String,
    /// Unix timestamp of this sync attempt.
    pub sync_timestamp: i64,
    /// Monotonic per-device counter, consumed once per attempt.
    pub sync_version: u64,
    pub format_version: u32,
    pub encryption_version: u32,
    pub item_counts: ItemCounts,
}

/// Authentication method for a connection profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    PublicKey,
    Agent,
}

/// A saved server connection profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    /// Reference to an [`SshKeyRecord`] id when `auth_method` is `PublicKey`.
    pub key_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: i64,
    pub modified_at: i64,
}

/// An SSH key pair. The private key travels in plaintext only inside the
/// encrypted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKeyRecord {
    pub id: String,
    pub name: String,
    pub key_type: String,
    pub public_key: String,
    pub private_key: String,
    pub fingerprint: String,
    pub created_at: i64,
    pub modified_at: i64,
}

/// A color theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theme {
    pub id: String,
    pub name: String,
    pub colors: BTreeMap<String, String>,
    pub font_size: Option<u32>,
    pub created_at: i64,
    pub modified_at: i64,
}

/// A trusted host key record (known-hosts entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownHostKey {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub key_type: String,
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    pub fingerprint: String,
    pub created_at: i64,
    pub modified_at: i64,
}

/// A dynamically-typed preference value.
///
/// Kept as a tagged union instead of raw JSON so merge comparisons are
/// structurally typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<String>),
}

/// Flat preference map.
pub type Preferences = BTreeMap<String, PrefValue>;

/// Fields excluded from content hashing: identity and bookkeeping, not
/// content.
const VOLATILE_FIELDS: &[&str] = &["id", "created_at", "modified_at"];

/// SHA-256 of a JSON value's canonical rendering, hex encoded. Object keys
/// are sorted by construction (`serde_json`'s default map is ordered).
pub fn hash_json(value: &Value) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

/// An entity that can participate in the three-way merge.
///
/// The content hash covers the serialized fields minus id and timestamps,
/// so re-keying or touching an entity without editing it does not register
/// as a change.
pub trait Syncable: Clone + Serialize + DeserializeOwned {
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;

    /// Replace the entity id (used when a KEEP_BOTH resolution re-keys a
    /// duplicate).
    fn set_id(&mut self, id: String);

    fn modified_at(&self) -> i64;

    /// Secondary identity used to detect the same logical entity created
    /// independently on two devices under different ids.
    fn identity_key(&self) -> String;

    /// Content fields as a flat JSON map, volatile fields stripped.
    fn field_map(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map
                .into_iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    /// Hash of the full content field map.
    fn content_hash(&self) -> String {
        let object: serde_json::Map<String, Value> = self.field_map().into_iter().collect();
        hash_json(&Value::Object(object))
    }

    /// Per-field content hashes, for field-level merge decisions.
    fn field_hashes(&self) -> BTreeMap<String, String> {
        self.field_map()
            .iter()
            .map(|(k, v)| (k.clone(), hash_json(v)))
            .collect()
    }
}

impl Syncable for ConnectionProfile {
    const ENTITY_TYPE: EntityType = EntityType::Connection;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn modified_at(&self) -> i64 {
        self.modified_at
    }

    fn identity_key(&self) -> String {
        format!("{}@{}", self.name, self.host)
    }
}

impl Syncable for SshKeyRecord {
    const ENTITY_TYPE: EntityType = EntityType::SshKey;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn modified_at(&self) -> i64 {
        self.modified_at
    }

    fn identity_key(&self) -> String {
        self.fingerprint.clone()
    }
}

impl Syncable for Theme {
    const ENTITY_TYPE: EntityType = EntityType::Theme;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn modified_at(&self) -> i64 {
        self.modified_at
    }

    fn identity_key(&self) -> String {
        self.name.clone()
    }
}

impl Syncable for KnownHostKey {
    const ENTITY_TYPE: EntityType = EntityType::HostKey;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn modified_at(&self) -> i64 {
        self.modified_at
    }

    fn identity_key(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

/// Hashes of one entity as of the last converged sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntry {
    pub content_hash: String,
    /// Per-field hashes backing field-level merge decisions.
    pub field_hashes: BTreeMap<String, String>,
}

impl BaseEntry {
    pub fn of<T: Syncable>(entity: &T) -> Self {
        Self {
            content_hash: entity.content_hash(),
            field_hashes: entity.field_hashes(),
        }
    }
}

/// Content-hash snapshot of every collection as of the last successful
/// convergence; the common ancestor for the next three-way merge.
///
/// An entry exists for an id iff the entity existed at the end of the prior
/// successful sync. Overwritten each cycle, never retained historically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBase {
    pub connections: BTreeMap<String, BaseEntry>,
    pub keys: BTreeMap<String, BaseEntry>,
    pub themes: BTreeMap<String, BaseEntry>,
    pub host_keys: BTreeMap<String, BaseEntry>,
    /// Preference key to value hash.
    pub preferences: BTreeMap<String, String>,
}

fn collection_base<T: Syncable>(items: &[T]) -> BTreeMap<String, BaseEntry> {
    items
        .iter()
        .map(|item| (item.id().to_string(), BaseEntry::of(item)))
        .collect()
}

impl SyncBase {
    /// Capture a base snapshot of the given collections.
    pub fn capture(
        connections: &[ConnectionProfile],
        keys: &[SshKeyRecord],
        themes: &[Theme],
        host_keys: &[KnownHostKey],
        preferences: &Preferences,
    ) -> Self {
        Self {
            connections: collection_base(connections),
            keys: collection_base(keys),
            themes: collection_base(themes),
            host_keys: collection_base(host_keys),
            preferences: preferences
                .iter()
                .map(|(k, v)| {
                    let value = serde_json::to_value(v).unwrap_or(Value::Null);
                    (k.clone(), hash_json(&value))
                })
                .collect(),
        }
    }
}

/// A device's current view of every synced collection, without sync
/// provenance. What the local store hands the engine and what the engine
/// hands back after a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub connections: Vec<ConnectionProfile>,
    pub keys: Vec<SshKeyRecord>,
    pub themes: Vec<Theme>,
    pub host_keys: Vec<KnownHostKey>,
    pub preferences: Preferences,
}

impl Snapshot {
    pub fn item_counts(&self) -> ItemCounts {
        ItemCounts {
            connections: self.connections.len(),
            keys: self.keys.len(),
            themes: self.themes.len(),
            host_keys: self.host_keys.len(),
            preferences: self.preferences.len(),
        }
    }

    /// Capture a base snapshot of these collections.
    pub fn capture_base(&self) -> SyncBase {
        SyncBase::capture(
            &self.connections,
            &self.keys,
            &self.themes,
            &self.host_keys,
            &self.preferences,
        )
    }
}

/// Full plaintext payload exchanged between devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFileData {
    pub metadata: SyncMetadata,
    pub connections: Vec<ConnectionProfile>,
    pub keys: Vec<SshKeyRecord>,
    pub themes: Vec<Theme>,
    pub host_keys: Vec<KnownHostKey>,
    pub preferences: Preferences,
    /// The sender's base snapshot at the time of upload.
    pub sync_base: SyncBase,
}

impl SyncFileData {
    /// Count the payload's items for the metadata header.
    pub fn item_counts(&self) -> ItemCounts {
        ItemCounts {
            connections: self.connections.len(),
            keys: self.keys.len(),
            themes: self.themes.len(),
            host_keys: self.host_keys.len(),
            preferences: self.preferences.len(),
        }
    }

    /// Capture a base snapshot of this payload's collections.
    pub fn capture_base(&self) -> SyncBase {
        SyncBase::capture(
            &self.connections,
            &self.keys,
            &self.themes,
            &self.host_keys,
            &self.preferences,
        )
    }

    /// Strip sync provenance, leaving the bare collections.
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            connections: self.connections,
            keys: self.keys,
            themes: self.themes,
            host_keys: self.host_keys,
            preferences: self.preferences,
        }
    }
}

/// Custom base64 serialization for `Vec<u8>`.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_connection(id: &str, host: &str) -> ConnectionProfile {
        ConnectionProfile {
            id: id.to_string(),
            name: format!("conn-{}", id),
            host: host.to_string(),
            port: 22,
            username: "admin".to_string(),
            auth_method: AuthMethod::Password,
            key_id: None,
            notes: None,
            created_at: 1700000000,
            modified_at: 1700000000,
        }
    }

    #[test]
    fn content_hash_ignores_volatile_fields() {
        let mut a = sample_connection("c1", "a.example.com");
        let mut b = a.clone();
        b.id = "c2".to_string();
        b.modified_at = 1800000000;
        b.created_at = 1800000000;

        assert_eq!(a.content_hash(), b.content_hash());

        a.host = "b.example.com".to_string();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn field_hashes_track_individual_fields() {
        let a = sample_connection("c1", "a.example.com");
        let mut b = a.clone();
        b.username = "root".to_string();

        let ha = a.field_hashes();
        let hb = b.field_hashes();

        assert_ne!(ha["username"], hb["username"]);
        assert_eq!(ha["host"], hb["host"]);
        assert!(!ha.contains_key("id"));
        assert!(!ha.contains_key("modified_at"));
    }

    #[test]
    fn identity_keys() {
        let conn = sample_connection("c1", "db.internal");
        assert_eq!(conn.identity_key(), "conn-c1@db.internal");

        let hk = KnownHostKey {
            id: "h1".to_string(),
            hostname: "db.internal".to_string(),
            port: 22,
            key_type: "ssh-ed25519".to_string(),
            public_key: vec![1, 2, 3],
            fingerprint: "SHA256:abc".to_string(),
            created_at: 0,
            modified_at: 0,
        };
        assert_eq!(hk.identity_key(), "db.internal:22");
    }

    #[test]
    fn host_key_public_key_serializes_as_base64() {
        let hk = KnownHostKey {
            id: "h1".to_string(),
            hostname: "db.internal".to_string(),
            port: 22,
            key_type: "ssh-ed25519".to_string(),
            public_key: vec![0xDE, 0xAD, 0xBE, 0xEF],
            fingerprint: "SHA256:abc".to_string(),
            created_at: 0,
            modified_at: 0,
        };

        let json = serde_json::to_value(&hk).unwrap();
        assert_eq!(json["public_key"], "3q2+7w==");

        let back: KnownHostKey = serde_json::from_value(json).unwrap();
        assert_eq!(back.public_key, hk.public_key);
    }

    #[test]
    fn pref_value_untagged_forms() {
        let prefs: Preferences = serde_json::from_str(
            r#"{"bell": true, "font_scale": 1.25, "shell": "zsh", "pinned": ["c1", "c2"]}"#,
        )
        .unwrap();

        assert_eq!(prefs["bell"], PrefValue::Bool(true));
        assert_eq!(prefs["font_scale"], PrefValue::Num(1.25));
        assert_eq!(prefs["shell"], PrefValue::Str("zsh".to_string()));
        assert_eq!(
            prefs["pinned"],
            PrefValue::List(vec!["c1".to_string(), "c2".to_string()])
        );
    }

    #[test]
    fn base_capture_membership() {
        let conns = vec![
            sample_connection("c1", "a.example.com"),
            sample_connection("c2", "b.example.com"),
        ];
        let mut prefs = Preferences::new();
        prefs.insert("bell".to_string(), PrefValue::Bool(true));

        let base = SyncBase::capture(&conns, &[], &[], &[], &prefs);

        assert_eq!(base.connections.len(), 2);
        assert_eq!(
            base.connections["c1"].content_hash,
            conns[0].content_hash()
        );
        assert!(base.keys.is_empty());
        assert_eq!(base.preferences.len(), 1);
    }
}
