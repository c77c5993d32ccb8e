//! Conflict model and batch resolution.
//!
//! The merge engine emits [`Conflict`]s; a human or a policy answers with
//! [`ConflictResolution`]s; [`ConflictResolver::apply`] folds the decisions
//! back into the merged snapshot. Conflicts left unanswered (or answered
//! with `Skip`) stay on the result and carry over to the next cycle.

use crate::sync::merge::{CompleteMergeResult, MergeResult};
use crate::sync::models::{EntityType, PrefValue, Syncable};
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Classification of a detected divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The same field was modified to different values on both sides.
    FieldModifiedBothSides,
    /// One side deleted the entity while the other modified it.
    DeletedModified,
    /// The same logical entity was created independently on both sides
    /// under different ids.
    CreatedDuplicate,
    /// A preference key diverged.
    PreferenceDiverged,
}

/// A detected divergence between local and remote state for one entity
/// or preference key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Stable reference for resolutions.
    pub conflict_id: Uuid,
    pub entity_type: EntityType,
    /// Entity id, or the preference key for `PreferenceDiverged`. For
    /// `CreatedDuplicate` this is the local copy's id.
    pub entity_id: String,
    pub kind: ConflictKind,
    /// Field name for field-level conflicts.
    pub field: Option<String>,
    /// `None` encodes "deleted on this side".
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    /// Content hash of the base version; the base snapshot retains hashes,
    /// not values.
    pub base_hash: Option<String>,
    pub local_modified_at: Option<i64>,
    pub remote_modified_at: Option<i64>,
    /// True when policy already resolved it last-write-wins; kept in the
    /// result for audit, never blocks convergence.
    pub auto_resolvable: bool,
    /// For `CreatedDuplicate`: the remote copy's id.
    pub remote_entity_id: Option<String>,
}

impl Conflict {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn field_modified<T: Syncable>(
        entity_id: &str,
        field: &str,
        local_value: Value,
        remote_value: Value,
        base_hash: Option<String>,
        local_modified_at: i64,
        remote_modified_at: i64,
        auto_resolvable: bool,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            entity_type: T::ENTITY_TYPE,
            entity_id: entity_id.to_string(),
            kind: ConflictKind::FieldModifiedBothSides,
            field: Some(field.to_string()),
            local_value: Some(local_value),
            remote_value: Some(remote_value),
            base_hash,
            local_modified_at: Some(local_modified_at),
            remote_modified_at: Some(remote_modified_at),
            auto_resolvable,
            remote_entity_id: None,
        }
    }

    /// Remote deleted the entity; local modified it and survives by default.
    pub(crate) fn deleted_modified_remote<T: Syncable>(local_entity: &T, base_hash: String) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            entity_type: T::ENTITY_TYPE,
            entity_id: local_entity.id().to_string(),
            kind: ConflictKind::DeletedModified,
            field: None,
            local_value: serde_json::to_value(local_entity).ok(),
            remote_value: None,
            base_hash: Some(base_hash),
            local_modified_at: Some(local_entity.modified_at()),
            remote_modified_at: None,
            auto_resolvable: false,
            remote_entity_id: None,
        }
    }

    /// Local deleted the entity; remote modified it and survives by default.
    pub(crate) fn deleted_modified_local<T: Syncable>(remote_entity: &T, base_hash: String) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            entity_type: T::ENTITY_TYPE,
            entity_id: remote_entity.id().to_string(),
            kind: ConflictKind::DeletedModified,
            field: None,
            local_value: None,
            remote_value: serde_json::to_value(remote_entity).ok(),
            base_hash: Some(base_hash),
            local_modified_at: None,
            remote_modified_at: Some(remote_entity.modified_at()),
            auto_resolvable: false,
            remote_entity_id: None,
        }
    }

    pub(crate) fn created_duplicate<T: Syncable>(
        local_entity: &T,
        remote_entity: &T,
        auto_resolvable: bool,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            entity_type: T::ENTITY_TYPE,
            entity_id: local_entity.id().to_string(),
            kind: ConflictKind::CreatedDuplicate,
            field: None,
            local_value: serde_json::to_value(local_entity).ok(),
            remote_value: serde_json::to_value(remote_entity).ok(),
            base_hash: None,
            local_modified_at: Some(local_entity.modified_at()),
            remote_modified_at: Some(remote_entity.modified_at()),
            auto_resolvable,
            remote_entity_id: Some(remote_entity.id().to_string()),
        }
    }

    pub(crate) fn preference_diverged(
        key: &str,
        local: Option<&PrefValue>,
        remote: Option<&PrefValue>,
        base_hash: Option<&String>,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            entity_type: EntityType::Preference,
            entity_id: key.to_string(),
            kind: ConflictKind::PreferenceDiverged,
            field: Some(key.to_string()),
            local_value: local.and_then(|v| serde_json::to_value(v).ok()),
            remote_value: remote.and_then(|v| serde_json::to_value(v).ok()),
            base_hash: base_hash.cloned(),
            local_modified_at: None,
            remote_modified_at: None,
            auto_resolvable: false,
            remote_entity_id: None,
        }
    }
}

/// Which side a resolution keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    KeepLocal,
    KeepRemote,
    /// Only valid for `CreatedDuplicate`: keep both copies, re-keying the
    /// remote one.
    KeepBoth,
    /// Leave the engine's default in place and carry the conflict forward.
    Skip,
}

/// A decision for one conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: Uuid,
    pub choice: ResolutionChoice,
    /// Broadcast this choice to every remaining conflict of the same kind.
    pub apply_to_all: bool,
}

/// Applies a batch of resolutions to a merge result.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Fold resolutions into the merged snapshot.
    ///
    /// Returns the conflicts that remain unresolved (skipped or
    /// unanswered); the result's per-collection conflict lists are
    /// reduced to the same set.
    pub fn apply(
        result: &mut CompleteMergeResult,
        resolutions: &[ConflictResolution],
        device_id: &str,
    ) -> Result<Vec<Conflict>> {
        let plan = build_plan(&result.all_conflicts(), resolutions);

        let mut unresolved = Vec::new();
        unresolved.extend(apply_entity_conflicts(&mut result.connections, &plan, device_id)?);
        unresolved.extend(apply_entity_conflicts(&mut result.keys, &plan, device_id)?);
        unresolved.extend(apply_entity_conflicts(&mut result.themes, &plan, device_id)?);
        unresolved.extend(apply_entity_conflicts(&mut result.host_keys, &plan, device_id)?);
        unresolved.extend(apply_preference_conflicts(result, &plan)?);

        Ok(unresolved)
    }
}

/// Resolve each conflict id to a choice: direct answers first, then
/// `apply_to_all` broadcasts over remaining same-kind conflicts.
fn build_plan(
    conflicts: &[Conflict],
    resolutions: &[ConflictResolution],
) -> BTreeMap<Uuid, ResolutionChoice> {
    let kind_of: BTreeMap<Uuid, ConflictKind> =
        conflicts.iter().map(|c| (c.conflict_id, c.kind)).collect();

    let mut plan = BTreeMap::new();
    for resolution in resolutions {
        plan.insert(resolution.conflict_id, resolution.choice);
    }

    for resolution in resolutions.iter().filter(|r| r.apply_to_all) {
        let Some(kind) = kind_of.get(&resolution.conflict_id) else {
            continue;
        };
        for conflict in conflicts.iter().filter(|c| c.kind == *kind) {
            plan.entry(conflict.conflict_id).or_insert(resolution.choice);
        }
    }

    plan
}

fn upsert<T: Syncable>(merged: &mut Vec<T>, entity: T) {
    match merged.iter_mut().find(|e| e.id() == entity.id()) {
        Some(slot) => *slot = entity,
        None => merged.push(entity),
    }
}

fn remove<T: Syncable>(merged: &mut Vec<T>, id: &str) {
    merged.retain(|e| e.id() != id);
}

fn decode<T: Syncable>(value: &Value) -> Result<T> {
    Ok(serde_json::from_value(value.clone())?)
}

fn patch_field<T: Syncable>(merged: &mut [T], id: &str, field: &str, value: &Value) -> Result<()> {
    let Some(slot) = merged.iter_mut().find(|e| e.id() == id) else {
        return Ok(()); // entity already removed by another resolution
    };
    let mut object = serde_json::to_value(&*slot)?;
    let Some(map) = object.as_object_mut() else {
        return Err(SyncError::InvalidInput(
            "entity did not serialize to an object".to_string(),
        ));
    };
    map.insert(field.to_string(), value.clone());
    *slot = serde_json::from_value(object)?;
    Ok(())
}

/// Deterministic re-key for a KEEP_BOTH duplicate: append the resolving
/// device's id, which no concurrently-created id can already carry.
/// Extended with a counter on the (pathological) chance of another
/// collision.
fn rekey_id<T: Syncable>(merged: &[T], original: &str, device_id: &str) -> String {
    let suffix = &device_id[..device_id.len().min(8)];
    let mut candidate = format!("{}-{}", original, suffix);
    let mut n = 1;
    while merged.iter().any(|e| e.id() == candidate) {
        n += 1;
        candidate = format!("{}-{}-{}", original, suffix, n);
    }
    candidate
}

fn apply_entity_conflicts<T: Syncable>(
    collection: &mut MergeResult<T>,
    plan: &BTreeMap<Uuid, ResolutionChoice>,
    device_id: &str,
) -> Result<Vec<Conflict>> {
    let conflicts = std::mem::take(&mut collection.conflicts);
    let mut unresolved = Vec::new();

    for conflict in conflicts {
        let choice = plan.get(&conflict.conflict_id).copied();
        let choice = match choice {
            None | Some(ResolutionChoice::Skip) => {
                unresolved.push(conflict);
                continue;
            }
            Some(choice) => choice,
        };

        match conflict.kind {
            ConflictKind::FieldModifiedBothSides => {
                let value = match choice {
                    ResolutionChoice::KeepLocal => &conflict.local_value,
                    ResolutionChoice::KeepRemote => &conflict.remote_value,
                    ResolutionChoice::KeepBoth => {
                        return Err(SyncError::InvalidResolution(
                            "KEEP_BOTH is only valid for duplicate creations".to_string(),
                        ))
                    }
                    ResolutionChoice::Skip => unreachable!(),
                };
                match (&conflict.field, value) {
                    (Some(field), Some(value)) => {
                        patch_field(&mut collection.merged, &conflict.entity_id, field, value)?;
                    }
                    (None, Some(value)) => {
                        upsert(&mut collection.merged, decode::<T>(value)?);
                    }
                    _ => {
                        return Err(SyncError::InvalidResolution(format!(
                            "conflict {} has no value for the chosen side",
                            conflict.conflict_id
                        )))
                    }
                }
            }

            ConflictKind::DeletedModified => {
                let value = match choice {
                    ResolutionChoice::KeepLocal => &conflict.local_value,
                    ResolutionChoice::KeepRemote => &conflict.remote_value,
                    ResolutionChoice::KeepBoth => {
                        return Err(SyncError::InvalidResolution(
                            "KEEP_BOTH is only valid for duplicate creations".to_string(),
                        ))
                    }
                    ResolutionChoice::Skip => unreachable!(),
                };
                match value {
                    // The chosen side had deleted it: accept the deletion
                    None => {
                        remove(&mut collection.merged, &conflict.entity_id);
                        collection.deleted.push(conflict.entity_id.clone());
                    }
                    Some(value) => upsert(&mut collection.merged, decode::<T>(value)?),
                }
            }

            ConflictKind::CreatedDuplicate => {
                let local = conflict.local_value.as_ref();
                let remote = conflict.remote_value.as_ref();
                let remote_id = conflict.remote_entity_id.as_deref();
                match choice {
                    ResolutionChoice::KeepLocal => {
                        if let Some(remote_id) = remote_id {
                            remove(&mut collection.merged, remote_id);
                        }
                        if let Some(local) = local {
                            upsert(&mut collection.merged, decode::<T>(local)?);
                        }
                    }
                    ResolutionChoice::KeepRemote => {
                        remove(&mut collection.merged, &conflict.entity_id);
                        if let Some(remote) = remote {
                            upsert(&mut collection.merged, decode::<T>(remote)?);
                        }
                    }
                    ResolutionChoice::KeepBoth => {
                        let (Some(local), Some(remote)) = (local, remote) else {
                            return Err(SyncError::InvalidResolution(format!(
                                "duplicate conflict {} is missing a side",
                                conflict.conflict_id
                            )));
                        };
                        upsert(&mut collection.merged, decode::<T>(local)?);

                        let mut rekeyed: T = decode(remote)?;
                        let new_id = rekey_id(
                            &collection.merged,
                            remote_id.unwrap_or(&conflict.entity_id),
                            device_id,
                        );
                        rekeyed.set_id(new_id.clone());
                        collection.added.push(new_id);
                        collection.merged.push(rekeyed);
                    }
                    ResolutionChoice::Skip => unreachable!(),
                }
            }

            ConflictKind::PreferenceDiverged => {
                // Preference conflicts never land on entity collections
                unresolved.push(conflict);
            }
        }
    }

    collection.conflicts = unresolved.clone();
    Ok(unresolved)
}

fn apply_preference_conflicts(
    result: &mut CompleteMergeResult,
    plan: &BTreeMap<Uuid, ResolutionChoice>,
) -> Result<Vec<Conflict>> {
    let conflicts = std::mem::take(&mut result.preferences.conflicts);
    let mut unresolved = Vec::new();

    for conflict in conflicts {
        let choice = plan.get(&conflict.conflict_id).copied();
        let value = match choice {
            None | Some(ResolutionChoice::Skip) => {
                unresolved.push(conflict);
                continue;
            }
            Some(ResolutionChoice::KeepLocal) => &conflict.local_value,
            Some(ResolutionChoice::KeepRemote) => &conflict.remote_value,
            Some(ResolutionChoice::KeepBoth) => {
                return Err(SyncError::InvalidResolution(
                    "KEEP_BOTH is only valid for duplicate creations".to_string(),
                ))
            }
        };

        match value {
            None => {
                result.preferences.merged.remove(&conflict.entity_id);
                result.preferences.deleted.push(conflict.entity_id.clone());
            }
            Some(value) => {
                let pref: PrefValue = serde_json::from_value(value.clone())?;
                result
                    .preferences
                    .merged
                    .insert(conflict.entity_id.clone(), pref);
            }
        }
    }

    result.preferences.conflicts = unresolved.clone();
    Ok(unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::merge::{merge_collection, merge_preferences, MergeOptions};
    use crate::sync::models::tests::sample_connection;
    use crate::sync::models::{BaseEntry, KnownHostKey, Preferences};

    const DEVICE: &str = "0123456789abcdef0123456789abcdef";

    fn host_key(id: &str, fingerprint: &str, modified_at: i64) -> KnownHostKey {
        KnownHostKey {
            id: id.to_string(),
            hostname: "db.internal".to_string(),
            port: 22,
            key_type: "ssh-ed25519".to_string(),
            public_key: fingerprint.as_bytes().to_vec(),
            fingerprint: fingerprint.to_string(),
            created_at: modified_at,
            modified_at,
        }
    }

    fn diverged_connections() -> CompleteMergeResult {
        let base_items = vec![sample_connection("c1", "a.example.com")];
        let base: std::collections::BTreeMap<String, BaseEntry> = base_items
            .iter()
            .map(|c| (c.id.clone(), BaseEntry::of(c)))
            .collect();

        let mut local = base_items.clone();
        local[0].host = "left.example.com".to_string();
        local[0].modified_at = 1700000100;
        let mut remote = base_items;
        remote[0].host = "right.example.com".to_string();
        remote[0].modified_at = 1700000200;

        CompleteMergeResult {
            connections: merge_collection(&local, &remote, &base, MergeOptions::default()),
            ..Default::default()
        }
    }

    #[test]
    fn keep_remote_patches_field() {
        let mut result = diverged_connections();
        let conflict_id = result.connections.conflicts[0].conflict_id;

        let unresolved = ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id,
                choice: ResolutionChoice::KeepRemote,
                apply_to_all: false,
            }],
            DEVICE,
        )
        .unwrap();

        assert!(unresolved.is_empty());
        assert!(result.connections.conflicts.is_empty());
        assert_eq!(result.connections.merged[0].host, "right.example.com");
    }

    #[test]
    fn keep_local_keeps_default() {
        let mut result = diverged_connections();
        let conflict_id = result.connections.conflicts[0].conflict_id;

        ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id,
                choice: ResolutionChoice::KeepLocal,
                apply_to_all: false,
            }],
            DEVICE,
        )
        .unwrap();

        assert_eq!(result.connections.merged[0].host, "left.example.com");
    }

    #[test]
    fn skip_leaves_conflict_pending() {
        let mut result = diverged_connections();
        let conflict_id = result.connections.conflicts[0].conflict_id;

        let unresolved = ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id,
                choice: ResolutionChoice::Skip,
                apply_to_all: false,
            }],
            DEVICE,
        )
        .unwrap();

        assert_eq!(unresolved.len(), 1);
        assert_eq!(result.connections.conflicts.len(), 1);
        // Engine default stays in place
        assert_eq!(result.connections.merged[0].host, "left.example.com");
    }

    #[test]
    fn unanswered_conflicts_stay_pending() {
        let mut result = diverged_connections();
        let unresolved = ConflictResolver::apply(&mut result, &[], DEVICE).unwrap();
        assert_eq!(unresolved.len(), 1);
    }

    #[test]
    fn keep_both_rekeys_duplicate() {
        let local = vec![host_key("h-local", "SHA256:aaa", 1700000100)];
        let remote = vec![host_key("h-remote", "SHA256:bbb", 1700000200)];
        let mut result = CompleteMergeResult {
            host_keys: merge_collection(
                &local,
                &remote,
                &std::collections::BTreeMap::new(),
                MergeOptions::default(),
            ),
            ..Default::default()
        };
        let conflict_id = result.host_keys.conflicts[0].conflict_id;

        let unresolved = ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id,
                choice: ResolutionChoice::KeepBoth,
                apply_to_all: false,
            }],
            DEVICE,
        )
        .unwrap();

        assert!(unresolved.is_empty());
        assert_eq!(result.host_keys.merged.len(), 2);

        let mut ids: Vec<&str> = result.host_keys.merged.iter().map(|k| k.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().any(|id| *id == "h-local"));
        assert!(ids.iter().any(|id| id.starts_with("h-remote-")));

        let mut fps: Vec<&str> = result
            .host_keys
            .merged
            .iter()
            .map(|k| k.fingerprint.as_str())
            .collect();
        fps.sort();
        assert_eq!(fps, vec!["SHA256:aaa", "SHA256:bbb"]);
    }

    #[test]
    fn keep_both_invalid_for_field_conflicts() {
        let mut result = diverged_connections();
        let conflict_id = result.connections.conflicts[0].conflict_id;

        let err = ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id,
                choice: ResolutionChoice::KeepBoth,
                apply_to_all: false,
            }],
            DEVICE,
        );

        assert!(matches!(err, Err(SyncError::InvalidResolution(_))));
    }

    #[test]
    fn keep_remote_accepts_remote_deletion() {
        // Remote deleted c1, local modified it
        let base_items = vec![sample_connection("c1", "a.example.com")];
        let base: std::collections::BTreeMap<String, BaseEntry> = base_items
            .iter()
            .map(|c| (c.id.clone(), BaseEntry::of(c)))
            .collect();
        let mut local = base_items;
        local[0].username = "root".to_string();
        local[0].modified_at = 1700000100;

        let mut result = CompleteMergeResult {
            connections: merge_collection(&local, &[], &base, MergeOptions::default()),
            ..Default::default()
        };
        assert_eq!(result.connections.conflicts[0].kind, ConflictKind::DeletedModified);
        let conflict_id = result.connections.conflicts[0].conflict_id;

        ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id,
                choice: ResolutionChoice::KeepRemote,
                apply_to_all: false,
            }],
            DEVICE,
        )
        .unwrap();

        assert!(result.connections.merged.is_empty());
        assert!(result.connections.deleted.contains(&"c1".to_string()));
    }

    #[test]
    fn apply_to_all_broadcasts_within_kind() {
        // Two preference divergences, one decision flagged apply_to_all
        let mut local = Preferences::new();
        local.insert("shell".to_string(), PrefValue::Str("zsh".to_string()));
        local.insert("editor".to_string(), PrefValue::Str("vim".to_string()));
        let mut remote = Preferences::new();
        remote.insert("shell".to_string(), PrefValue::Str("fish".to_string()));
        remote.insert("editor".to_string(), PrefValue::Str("nano".to_string()));

        let mut result = CompleteMergeResult {
            preferences: merge_preferences(
                &local,
                &remote,
                &std::collections::BTreeMap::new(),
                MergeOptions::default(),
            ),
            ..Default::default()
        };
        assert_eq!(result.preferences.conflicts.len(), 2);
        let first = result.preferences.conflicts[0].conflict_id;

        let unresolved = ConflictResolver::apply(
            &mut result,
            &[ConflictResolution {
                conflict_id: first,
                choice: ResolutionChoice::KeepRemote,
                apply_to_all: true,
            }],
            DEVICE,
        )
        .unwrap();

        assert!(unresolved.is_empty());
        assert_eq!(
            result.preferences.merged["shell"],
            PrefValue::Str("fish".to_string())
        );
        assert_eq!(
            result.preferences.merged["editor"],
            PrefValue::Str("nano".to_string())
        );
    }
}
