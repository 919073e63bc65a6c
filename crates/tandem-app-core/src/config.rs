// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed JSON config records over a raw key/blob storage port.
//!
//! A session keeps two records here: its [`SyncPrefs`](crate::prefs::SyncPrefs)
//! and the fingerprint of the last schema it opened. Adapters only move bytes;
//! encoding lives in [`ConfigService`].

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Raw blob storage keyed by record name.
pub trait ConfigStore {
    /// Bytes stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the bytes stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

macro_rules! forward_store {
    ($($ptr:ident),+) => {$(
        impl<T: ConfigStore + ?Sized> ConfigStore for $ptr<T> {
            fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
                T::load_raw(self, key)
            }

            fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
                T::save_raw(self, key, data)
            }
        }
    )+};
}

forward_store!(Arc, Box);

/// Config load/save failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("config record not found")]
    NotFound,
    /// Backing storage failed.
    #[error("config storage: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes are not a valid record.
    #[error("config encoding: {0}")]
    Serde(#[from] serde_json::Error),
    /// Adapter-specific failure.
    #[error("config: {0}")]
    Other(String),
}

/// Typed view over a [`ConfigStore`]; records are pretty-printed JSON.
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Wrap `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Unwrap the underlying store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Decode the record under `key`. Missing and empty records are `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.load_raw(key) {
            Err(ConfigError::NotFound) => return Ok(None),
            other => other?,
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Decode the record under `key`, or write and return `T::default()` if
    /// there is none. A failed write does not fail the load; it comes back as
    /// the second element.
    pub fn load_or_init<T>(&self, key: &str) -> Result<(T, Option<ConfigError>), ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        Ok(match self.load(key)? {
            Some(record) => (record, None),
            None => {
                let record = T::default();
                let write_err = self.save(key, &record).err();
                (record, write_err)
            }
        })
    }

    /// Encode `value` and store it under `key`.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        self.store.save_raw(key, &serde_json::to_vec_pretty(value)?)
    }
}
