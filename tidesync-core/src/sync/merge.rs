//! Three-way merge engine.
//!
//! Merges a local snapshot and a remote snapshot against the base captured
//! at the last successful convergence. Pure and synchronous: the caller
//! applies the result. Change classification is by content hash; per-field
//! hashes in the base decide field-level merges when both sides edited the
//! same entity.

use crate::sync::conflict::{Conflict, ConflictKind};
use crate::sync::models::{
    hash_json, BaseEntry, ConnectionProfile, KnownHostKey, PrefValue, Preferences, Snapshot,
    SshKeyRecord, SyncBase, Syncable, Theme,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Merge policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Resolve conflicts with known timestamps on both sides
    /// last-write-wins instead of leaving them blocking.
    pub auto_resolve: bool,
}

/// Outcome of merging one entity collection.
#[derive(Debug, Clone)]
pub struct MergeResult<T> {
    pub merged: Vec<T>,
    pub conflicts: Vec<Conflict>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl<T> Default for MergeResult<T> {
    fn default() -> Self {
        Self {
            merged: Vec::new(),
            conflicts: Vec::new(),
            added: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> MergeResult<T> {
    /// True when the merge changed nothing and detected nothing.
    pub fn is_clean_noop(&self) -> bool {
        self.conflicts.is_empty()
            && self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
    }
}

/// Outcome of merging the preference map.
#[derive(Debug, Clone, Default)]
pub struct PreferenceMergeResult {
    pub merged: Preferences,
    pub conflicts: Vec<Conflict>,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl PreferenceMergeResult {
    pub fn is_clean_noop(&self) -> bool {
        self.conflicts.is_empty()
            && self.added.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
    }
}

/// Aggregated outcome across every collection.
#[derive(Debug, Clone, Default)]
pub struct CompleteMergeResult {
    pub connections: MergeResult<ConnectionProfile>,
    pub keys: MergeResult<SshKeyRecord>,
    pub themes: MergeResult<Theme>,
    pub host_keys: MergeResult<KnownHostKey>,
    pub preferences: PreferenceMergeResult,
}

impl CompleteMergeResult {
    /// All conflicts across collections, cloned into one list.
    pub fn all_conflicts(&self) -> Vec<Conflict> {
        let mut out = Vec::new();
        out.extend(self.connections.conflicts.iter().cloned());
        out.extend(self.keys.conflicts.iter().cloned());
        out.extend(self.themes.conflicts.iter().cloned());
        out.extend(self.host_keys.conflicts.iter().cloned());
        out.extend(self.preferences.conflicts.iter().cloned());
        out
    }

    /// Conflicts that require an explicit resolution before convergence.
    pub fn blocking_conflicts(&self) -> Vec<Conflict> {
        self.all_conflicts()
            .into_iter()
            .filter(|c| !c.auto_resolvable)
            .collect()
    }

    /// True when nothing changed and nothing diverged.
    pub fn is_clean_noop(&self) -> bool {
        self.connections.is_clean_noop()
            && self.keys.is_clean_noop()
            && self.themes.is_clean_noop()
            && self.host_keys.is_clean_noop()
            && self.preferences.is_clean_noop()
    }

    /// The merged collections as a snapshot ready to persist and upload.
    pub fn merged_snapshot(&self) -> Snapshot {
        Snapshot {
            connections: self.connections.merged.clone(),
            keys: self.keys.merged.clone(),
            themes: self.themes.merged.clone(),
            host_keys: self.host_keys.merged.clone(),
            preferences: self.preferences.merged.clone(),
        }
    }
}

/// Merge both snapshots against the base, per collection.
pub fn merge_snapshots(
    local: &Snapshot,
    remote: &Snapshot,
    base: &SyncBase,
    opts: MergeOptions,
) -> CompleteMergeResult {
    let result = CompleteMergeResult {
        connections: merge_collection(&local.connections, &remote.connections, &base.connections, opts),
        keys: merge_collection(&local.keys, &remote.keys, &base.keys, opts),
        themes: merge_collection(&local.themes, &remote.themes, &base.themes, opts),
        host_keys: merge_collection(&local.host_keys, &remote.host_keys, &base.host_keys, opts),
        preferences: merge_preferences(&local.preferences, &remote.preferences, &base.preferences, opts),
    };
    debug!(
        conflicts = result.all_conflicts().len(),
        blocking = result.blocking_conflicts().len(),
        "merge complete"
    );
    result
}

/// Merge one entity collection three ways.
pub fn merge_collection<T: Syncable>(
    local: &[T],
    remote: &[T],
    base: &BTreeMap<String, BaseEntry>,
    opts: MergeOptions,
) -> MergeResult<T> {
    let local_by_id: BTreeMap<&str, &T> = local.iter().map(|e| (e.id(), e)).collect();
    let remote_by_id: BTreeMap<&str, &T> = remote.iter().map(|e| (e.id(), e)).collect();

    let mut ids: BTreeSet<&str> = BTreeSet::new();
    ids.extend(local_by_id.keys());
    ids.extend(remote_by_id.keys());
    ids.extend(base.keys().map(|k| k.as_str()));

    let mut result = MergeResult::default();

    for id in ids {
        let l = local_by_id.get(id).copied();
        let r = remote_by_id.get(id).copied();
        let b = base.get(id);

        match (l, r, b) {
            // New creation on exactly one side
            (Some(l), None, None) => {
                result.merged.push(l.clone());
                result.added.push(id.to_string());
            }
            (None, Some(r), None) => {
                result.merged.push(r.clone());
                result.added.push(id.to_string());
            }

            // Same id created independently on both sides: no base evidence,
            // so every differing field is a both-sides edit.
            (Some(l), Some(r), None) => {
                if l.content_hash() == r.content_hash() {
                    result.merged.push(l.clone());
                    result.added.push(id.to_string());
                } else {
                    merge_fields(l, r, None, opts, &mut result);
                    result.added.push(id.to_string());
                }
            }

            // Gone from both sides
            (None, None, Some(_)) => {
                result.deleted.push(id.to_string());
            }

            // Deleted remotely
            (Some(l), None, Some(b)) => {
                if l.content_hash() == b.content_hash {
                    // Local unchanged: the deletion propagates
                    result.deleted.push(id.to_string());
                } else {
                    // Local modified what remote deleted: keep the data,
                    // surface the divergence
                    result.conflicts.push(Conflict::deleted_modified_remote::<T>(
                        l,
                        b.content_hash.clone(),
                    ));
                    result.merged.push(l.clone());
                }
            }

            // Deleted locally
            (None, Some(r), Some(b)) => {
                if r.content_hash() == b.content_hash {
                    result.deleted.push(id.to_string());
                } else {
                    result.conflicts.push(Conflict::deleted_modified_local::<T>(
                        r,
                        b.content_hash.clone(),
                    ));
                    result.merged.push(r.clone());
                }
            }

            // Present everywhere: classify by content hash
            (Some(l), Some(r), Some(b)) => {
                let lh = l.content_hash();
                let rh = r.content_hash();

                if lh == rh {
                    // Identical, including the both-made-the-same-edit case
                    result.merged.push(l.clone());
                    if lh != b.content_hash {
                        result.updated.push(id.to_string());
                    }
                } else if lh == b.content_hash {
                    // Local unchanged: remote wins without conflict
                    result.merged.push(r.clone());
                    result.updated.push(id.to_string());
                } else if rh == b.content_hash {
                    // Remote unchanged: local wins without conflict
                    result.merged.push(l.clone());
                    result.updated.push(id.to_string());
                } else {
                    merge_fields(l, r, Some(b), opts, &mut result);
                    result.updated.push(id.to_string());
                }
            }

            (None, None, None) => unreachable!("id came from one of the three maps"),
        }
    }

    let local_ids: BTreeSet<&str> = local_by_id.keys().copied().collect();
    reconcile_duplicate_creations(&local_ids, base, opts, &mut result);

    result
}

/// Field-level merge for an entity modified on both sides.
///
/// With base field hashes, disjoint edits auto-merge; a field changed on
/// both sides to different values conflicts. Without base evidence every
/// differing field conflicts. The merged entity defaults to the local
/// value for conflicted fields (or the LWW winner under auto-resolve).
fn merge_fields<T: Syncable>(
    l: &T,
    r: &T,
    base: Option<&BaseEntry>,
    opts: MergeOptions,
    result: &mut MergeResult<T>,
) {
    let local_fields = l.field_map();
    let remote_fields = r.field_map();

    let remote_wins_lww = r.modified_at() > l.modified_at();
    let mut patched = l.clone();

    for (field, lv) in &local_fields {
        let rv = match remote_fields.get(field) {
            Some(rv) => rv,
            None => continue,
        };
        if lv == rv {
            continue;
        }

        let base_field_hash = base.and_then(|b| b.field_hashes.get(field));
        let local_changed = base_field_hash.map_or(true, |h| hash_json(lv) != *h);
        let remote_changed = base_field_hash.map_or(true, |h| hash_json(rv) != *h);

        if !local_changed {
            // Only remote touched this field
            patched = patch_field(&patched, field, rv);
            continue;
        }
        if !remote_changed {
            continue;
        }

        // Both sides changed the same field to different values
        let auto = opts.auto_resolve;
        if auto && remote_wins_lww {
            patched = patch_field(&patched, field, rv);
        }
        result.conflicts.push(Conflict::field_modified::<T>(
            l.id(),
            field,
            lv.clone(),
            rv.clone(),
            base.map(|b| b.content_hash.clone()),
            l.modified_at(),
            r.modified_at(),
            auto,
        ));
    }

    result.merged.push(patched);
}

/// Replace one content field through the entity's JSON representation.
///
/// Falls back to the unpatched entity if the round-trip fails, which for
/// these closed structs only happens on a type-mismatched value.
fn patch_field<T: Syncable>(entity: &T, field: &str, value: &Value) -> T {
    let patched = serde_json::to_value(entity).ok().and_then(|mut v| {
        v.as_object_mut()?.insert(field.to_string(), value.clone());
        serde_json::from_value(v).ok()
    });
    patched.unwrap_or_else(|| entity.clone())
}

/// Detect the same logical entity created independently under different
/// ids on both sides, via the secondary identity key.
///
/// Only cross-origin pairs count: two local entries sharing an identity
/// key are pre-existing local state, not a sync divergence.
fn reconcile_duplicate_creations<T: Syncable>(
    local_ids: &BTreeSet<&str>,
    base: &BTreeMap<String, BaseEntry>,
    opts: MergeOptions,
    result: &mut MergeResult<T>,
) {
    let mut local_new: BTreeMap<String, String> = BTreeMap::new();
    let mut remote_new: Vec<(String, String)> = Vec::new();
    for e in &result.merged {
        // Only creations (ids absent from base) can collide this way
        if base.contains_key(e.id()) {
            continue;
        }
        if local_ids.contains(e.id()) {
            local_new.insert(e.identity_key(), e.id().to_string());
        } else {
            remote_new.push((e.identity_key(), e.id().to_string()));
        }
    }

    for (identity, remote_id) in remote_new {
        let Some(local_id) = local_new.get(&identity) else {
            continue;
        };

        let local_entity = match result.merged.iter().find(|e| e.id() == local_id.as_str()) {
            Some(e) => e.clone(),
            None => continue,
        };
        let remote_entity = match result.merged.iter().find(|e| e.id() == remote_id) {
            Some(e) => e.clone(),
            None => continue,
        };

        if local_entity.content_hash() == remote_entity.content_hash() {
            // Identical content under two ids: silently dedupe on the
            // local id
            result.merged.retain(|e| e.id() != remote_id);
            result.added.retain(|id| *id != remote_id);
            continue;
        }

        debug!(identity = %identity, "duplicate creation detected");

        let auto = opts.auto_resolve;
        let remote_wins = auto && remote_entity.modified_at() > local_entity.modified_at();
        let dropped = if remote_wins { local_id.clone() } else { remote_id.clone() };

        result.merged.retain(|e| e.id() != dropped);
        result.added.retain(|id| *id != dropped);

        result.conflicts.push(Conflict::created_duplicate::<T>(
            &local_entity,
            &remote_entity,
            auto,
        ));
    }
}

/// Merge the flat preference map (case logic at key granularity; no
/// timestamps, so divergence is never auto-resolvable).
pub fn merge_preferences(
    local: &Preferences,
    remote: &Preferences,
    base: &BTreeMap<String, String>,
    _opts: MergeOptions,
) -> PreferenceMergeResult {
    let mut keys: BTreeSet<&str> = BTreeSet::new();
    keys.extend(local.keys().map(|k| k.as_str()));
    keys.extend(remote.keys().map(|k| k.as_str()));
    keys.extend(base.keys().map(|k| k.as_str()));

    let mut result = PreferenceMergeResult::default();

    for key in keys {
        let l = local.get(key);
        let r = remote.get(key);
        let b = base.get(key);

        let lh = l.map(pref_hash);
        let rh = r.map(pref_hash);

        match (l, r, b) {
            (Some(l), None, None) => {
                result.merged.insert(key.to_string(), l.clone());
                result.added.push(key.to_string());
            }
            (None, Some(r), None) => {
                result.merged.insert(key.to_string(), r.clone());
                result.added.push(key.to_string());
            }
            (Some(l), Some(r), None) => {
                if lh == rh {
                    result.merged.insert(key.to_string(), l.clone());
                    result.added.push(key.to_string());
                } else {
                    result.conflicts.push(Conflict::preference_diverged(
                        key,
                        Some(l),
                        Some(r),
                        None,
                    ));
                    result.merged.insert(key.to_string(), l.clone());
                }
            }
            (None, None, Some(_)) => {
                result.deleted.push(key.to_string());
            }
            (Some(l), None, Some(b)) => {
                if lh.as_deref() == Some(b.as_str()) {
                    result.deleted.push(key.to_string());
                } else {
                    result.conflicts.push(Conflict::preference_diverged(
                        key,
                        Some(l),
                        None,
                        Some(b),
                    ));
                    result.merged.insert(key.to_string(), l.clone());
                }
            }
            (None, Some(r), Some(b)) => {
                if rh.as_deref() == Some(b.as_str()) {
                    result.deleted.push(key.to_string());
                } else {
                    result.conflicts.push(Conflict::preference_diverged(
                        key,
                        None,
                        Some(r),
                        Some(b),
                    ));
                    result.merged.insert(key.to_string(), r.clone());
                }
            }
            (Some(l), Some(r), Some(b)) => {
                if lh == rh {
                    result.merged.insert(key.to_string(), l.clone());
                    if lh.as_deref() != Some(b.as_str()) {
                        result.updated.push(key.to_string());
                    }
                } else if lh.as_deref() == Some(b.as_str()) {
                    result.merged.insert(key.to_string(), r.clone());
                    result.updated.push(key.to_string());
                } else if rh.as_deref() == Some(b.as_str()) {
                    result.merged.insert(key.to_string(), l.clone());
                    result.updated.push(key.to_string());
                } else {
                    result.conflicts.push(Conflict::preference_diverged(
                        key,
                        Some(l),
                        Some(r),
                        Some(b),
                    ));
                    result.merged.insert(key.to_string(), l.clone());
                }
            }
            // `key` comes from the union of local/remote/base key sets, so at
            // least one of the three is always `Some`; this arm is unreachable.
            (None, None, None) => unreachable!(),
        }
    }

    result
}

fn pref_hash(value: &PrefValue) -> String {
    hash_json(&serde_json::to_value(value).unwrap_or(Value::Null))
}
