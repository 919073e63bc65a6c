// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sync-session preferences and persisted schema state.

use serde::{Deserialize, Serialize};

/// Config key holding [`SyncPrefs`].
pub const SYNC_PREFS_KEY: &str = "sync";
/// Config key holding [`SchemaState`].
pub const SCHEMA_STATE_KEY: &str = "schema_state";

/// Local storage engine requested from the store factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Volatile, process-local.
    #[default]
    Memory,
    /// Browser IndexedDB.
    IndexedDb,
    /// SQLite file.
    Sqlite,
    /// Origin-private file system.
    Opfs,
}

/// Saved preferences for a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPrefs {
    /// Local storage engine.
    pub storage_backend: StorageBackend,
    /// Current schema version; older documents go through the migration callback.
    pub schema_version: u32,
    /// Start replication as soon as the session opens.
    pub auto_start: bool,
    /// Maximum window of a single remote fetch.
    pub remote_page_size: usize,
    /// Delay before a channel with no subscribers is detached.
    pub channel_detach_delay_ms: u64,
    /// Coordinate with other replicas through a leader channel.
    pub leader_election: bool,
}

impl Default for SyncPrefs {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackend::default(),
            schema_version: 0,
            auto_start: true,
            remote_page_size: 1000,
            channel_detach_delay_ms: 3000,
            leader_election: false,
        }
    }
}

/// What the last opened replica was built from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaState {
    /// Hex schema fingerprint.
    pub fingerprint: String,
    /// Schema version the collections were created with.
    pub schema_version: u32,
}
