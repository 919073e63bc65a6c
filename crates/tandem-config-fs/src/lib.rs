// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! [`ConfigStore`] that keeps one `<key>.json` file per record.
//!
//! By default the files live in the platform config directory
//! (`~/.config/tandem` on Linux). Writes go to a sibling temp file first and
//! are renamed into place, so a crash never leaves a half-written record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tandem_app_core::config::{ConfigError, ConfigStore};

/// Directory of JSON config records.
#[derive(Debug, Clone)]
pub struct FsConfigStore {
    dir: PathBuf,
}

impl FsConfigStore {
    /// Open the platform config directory for Tandem, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("dev", "flyingrobots", "tandem")
            .ok_or_else(|| ConfigError::Other("no home directory to place config in".into()))?;
        Self::with_base(dirs.config_dir())
    }

    /// Open `dir`, creating it if needed.
    pub fn with_base(dir: &Path) -> Result<Self, ConfigError> {
        fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_owned() })
    }

    /// Directory the records live in.
    pub fn base(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, ConfigError> {
        let plain = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !plain {
            return Err(ConfigError::Other(format!("invalid config key {key:?}")));
        }
        Ok(self.dir.join(key).with_extension("json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        fs::read(self.record_path(key)?).map_err(|err| match err.kind() {
            ErrorKind::NotFound => ConfigError::NotFound,
            _ => ConfigError::Io(err),
        })
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.record_path(key)?;
        let staged = path.with_extension("json.tmp");
        fs::write(&staged, data)?;
        fs::rename(&staged, &path)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tandem_app_core::config::ConfigService;
    use tandem_app_core::prefs::{SyncPrefs, SYNC_PREFS_KEY};

    #[test]
    fn prefs_are_stored_as_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::with_base(dir.path()).unwrap();
        assert!(matches!(store.load_raw(SYNC_PREFS_KEY), Err(ConfigError::NotFound)));

        let config = ConfigService::new(store);
        let prefs = SyncPrefs {
            schema_version: 4,
            ..SyncPrefs::default()
        };
        config.save(SYNC_PREFS_KEY, &prefs).unwrap();
        assert!(dir.path().join("sync.json").exists());
        assert!(!dir.path().join("sync.json.tmp").exists());
        assert_eq!(config.load::<SyncPrefs>(SYNC_PREFS_KEY).unwrap(), Some(prefs));
    }

    #[test]
    fn keys_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::with_base(&dir.path().join("nested")).unwrap();
        for key in ["../sync", "a/b", ""] {
            assert!(matches!(store.save_raw(key, b"{}"), Err(ConfigError::Other(_))));
        }
        assert!(matches!(store.load_raw("schema_state"), Err(ConfigError::NotFound)));
    }
}
