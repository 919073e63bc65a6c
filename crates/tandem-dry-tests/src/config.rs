// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Config store fake backed by a shared map, with an access journal and
//! switchable failures.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tandem_app_core::config::{ConfigError, ConfigStore};

/// One call made against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigAccess {
    /// `load_raw(key)`.
    Load(String),
    /// `save_raw(key, ..)`.
    Save(String),
}

/// In-memory [`ConfigStore`].
///
/// Clones share state, so a test can hand one clone to a session and keep
/// another to inspect what was persisted.
///
/// ```
/// use tandem_dry_tests::InMemoryConfigStore;
/// use tandem_app_core::config::ConfigService;
/// use tandem_app_core::prefs::{SyncPrefs, SYNC_PREFS_KEY};
///
/// let store = InMemoryConfigStore::new();
/// ConfigService::new(store.clone())
///     .save(SYNC_PREFS_KEY, &SyncPrefs::default())
///     .unwrap();
/// assert_eq!(store.save_count(), 1);
/// assert!(store.contains_key(SYNC_PREFS_KEY));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    blobs: BTreeMap<String, Vec<u8>>,
    journal: Vec<ConfigAccess>,
    broken_loads: bool,
    broken_saves: bool,
}

impl InMemoryConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with serialized JSON documents, e.g. persisted prefs or
    /// a schema state from an earlier run.
    pub fn with_json(entries: &[(&str, Value)]) -> Self {
        let blobs = entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.to_string().into_bytes()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                blobs,
                ..State::default()
            })),
        }
    }

    /// Make every subsequent `load_raw` fail.
    pub fn set_fail_on_load(&self, fail: bool) {
        self.state().broken_loads = fail;
    }

    /// Make every subsequent `save_raw` fail; stored values stay untouched.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.state().broken_saves = fail;
    }

    /// Calls made so far, in order, failed ones included.
    pub fn journal(&self) -> Vec<ConfigAccess> {
        self.state().journal.clone()
    }

    /// Number of load attempts.
    pub fn load_count(&self) -> usize {
        self.count(|access| matches!(access, ConfigAccess::Load(_)))
    }

    /// Number of save attempts.
    pub fn save_count(&self) -> usize {
        self.count(|access| matches!(access, ConfigAccess::Save(_)))
    }

    /// Whether a value is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state().blobs.contains_key(key)
    }

    /// Value under `key`, parsed as JSON.
    pub fn json(&self, key: &str) -> Option<Value> {
        let state = self.state();
        serde_json::from_slice(state.blobs.get(key)?).ok()
    }

    fn count(&self, pred: impl Fn(&ConfigAccess) -> bool) -> usize {
        self.state().journal.iter().filter(|access| pred(access)).count()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut state = self.state();
        state.journal.push(ConfigAccess::Load(key.to_owned()));
        if state.broken_loads {
            return Err(ConfigError::Other(format!("injected load failure for {key}")));
        }
        state.blobs.get(key).cloned().ok_or(ConfigError::NotFound)
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut state = self.state();
        state.journal.push(ConfigAccess::Save(key.to_owned()));
        if state.broken_saves {
            return Err(ConfigError::Other(format!("injected save failure for {key}")));
        }
        state.blobs.insert(key.to_owned(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seeded_values_survive_a_failed_save() {
        let store = InMemoryConfigStore::with_json(&[("sync", json!({"schema_version": 3}))]);
        assert_eq!(store.json("sync"), Some(json!({"schema_version": 3})));
        store.set_fail_on_save(true);
        assert!(store.save_raw("sync", b"{}").is_err());
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.json("sync"), Some(json!({"schema_version": 3})));
    }

    #[test]
    fn journal_records_calls_in_order() {
        let store = InMemoryConfigStore::new();
        assert!(matches!(store.load_raw("a"), Err(ConfigError::NotFound)));
        store.save_raw("a", b"1").unwrap();
        assert_eq!(store.load_raw("a").unwrap(), b"1");
        assert_eq!(
            store.journal(),
            vec![
                ConfigAccess::Load("a".into()),
                ConfigAccess::Save("a".into()),
                ConfigAccess::Load("a".into()),
            ]
        );
        assert_eq!(store.load_count(), 2);
    }
}
