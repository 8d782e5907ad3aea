//! Persisted reconciliation state of a two-way sync.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{DavError, DavResult};

/// Transient per-run state of one side of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Item is no longer present in the store.
    NotPresent,
    /// Item is present and its content has not changed.
    NotChanged,
    /// Item is present but its content changed since the last sync.
    Modified,
}

/// Pairings and revisions persisted between two-way sync runs.
///
/// The JSON field names are part of the persisted format; unknown keys are
/// ignored on load and missing keys default to empty. The per-run state
/// maps are never persisted.
///
/// Invariant: every key of the remote→local mapping has an entry in both
/// revision tables; removal drops all three atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncMetadata {
    #[serde(rename = "LocalSyncToken")]
    local_sync_token: String,
    #[serde(rename = "RemoteSyncToken")]
    remote_sync_token: String,
    #[serde(rename = "LocalRevisions")]
    local_revisions: BTreeMap<String, String>,
    #[serde(rename = "RemoteRevisions")]
    remote_revisions: BTreeMap<String, String>,
    #[serde(rename = "RemoteToLocalMapping")]
    remote_to_local: BTreeMap<String, String>,
    #[serde(skip)]
    remote_state: HashMap<String, ItemState>,
    #[serde(skip)]
    local_state: HashMap<String, ItemState>,
}

impl PartialEq for SyncMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.local_sync_token == other.local_sync_token
            && self.remote_sync_token == other.remote_sync_token
            && self.local_revisions == other.local_revisions
            && self.remote_revisions == other.remote_revisions
            && self.remote_to_local == other.remote_to_local
    }
}

impl SyncMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> DavResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| DavError::Malformed(format!("cannot parse sync metadata: {err}")))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("metadata serializes")
    }

    /// Record a pairing of remote and local items detected as identical.
    pub fn add_item(
        &mut self,
        remote_id: &str,
        remote_revision: &str,
        local_id: &str,
        local_revision: &str,
    ) {
        self.remote_to_local
            .insert(remote_id.to_string(), local_id.to_string());
        self.remote_revisions
            .insert(remote_id.to_string(), remote_revision.to_string());
        self.local_revisions
            .insert(local_id.to_string(), local_revision.to_string());
    }

    /// Drop a pairing and both revision entries.
    pub fn remove_item(&mut self, remote_id: &str, local_id: &str) {
        self.remote_to_local.remove(remote_id);
        self.remote_revisions.remove(remote_id);
        self.local_revisions.remove(local_id);
        self.remote_state.remove(remote_id);
        self.local_state.remove(local_id);
    }

    pub fn update_remote_revision(&mut self, remote_id: &str, revision: &str) {
        self.remote_revisions
            .insert(remote_id.to_string(), revision.to_string());
    }

    pub fn update_local_revision(&mut self, local_id: &str, revision: &str) {
        self.local_revisions
            .insert(local_id.to_string(), revision.to_string());
    }

    pub fn remote_revision(&self, remote_id: &str) -> Option<&str> {
        self.remote_revisions.get(remote_id).map(String::as_str)
    }

    pub fn local_revision(&self, local_id: &str) -> Option<&str> {
        self.local_revisions.get(local_id).map(String::as_str)
    }

    pub fn has_remote_id(&self, remote_id: &str) -> bool {
        self.remote_revisions.contains_key(remote_id)
    }

    pub fn has_local_id(&self, local_id: &str) -> bool {
        self.local_revisions.contains_key(local_id)
    }

    pub fn local_id_for(&self, remote_id: &str) -> Option<&str> {
        self.remote_to_local.get(remote_id).map(String::as_str)
    }

    /// All `(remote_id, local_id)` pairings.
    pub fn pairings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.remote_to_local
            .iter()
            .map(|(r, l)| (r.as_str(), l.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.remote_to_local.is_empty()
    }

    pub fn local_sync_token(&self) -> &str {
        &self.local_sync_token
    }

    pub fn set_local_sync_token(&mut self, token: impl Into<String>) {
        self.local_sync_token = token.into();
    }

    pub fn remote_sync_token(&self) -> &str {
        &self.remote_sync_token
    }

    pub fn set_remote_sync_token(&mut self, token: impl Into<String>) {
        self.remote_sync_token = token.into();
    }

    // ----------- per-run state -----------

    /// Set the state of every paired remote item.
    pub fn reset_remote_state(&mut self, state: ItemState) {
        self.remote_state = self
            .remote_to_local
            .keys()
            .map(|id| (id.clone(), state))
            .collect();
    }

    /// Set the state of every paired local item.
    pub fn reset_local_state(&mut self, state: ItemState) {
        self.local_state = self
            .remote_to_local
            .values()
            .map(|id| (id.clone(), state))
            .collect();
    }

    pub fn set_remote_state(&mut self, remote_id: &str, state: ItemState) {
        if self.has_remote_id(remote_id) {
            self.remote_state.insert(remote_id.to_string(), state);
        }
    }

    pub fn set_local_state(&mut self, local_id: &str, state: ItemState) {
        if self.has_local_id(local_id) {
            self.local_state.insert(local_id.to_string(), state);
        }
    }

    /// Pairings whose sides are in the given states.
    pub fn items_with_state(
        &self,
        remote: ItemState,
        local: ItemState,
    ) -> Vec<(String, String)> {
        self.remote_to_local
            .iter()
            .filter(|(remote_id, local_id)| {
                self.remote_state.get(*remote_id) == Some(&remote)
                    && self.local_state.get(*local_id) == Some(&local)
            })
            .map(|(remote_id, local_id)| (remote_id.clone(), local_id.clone()))
            .collect()
    }
}
