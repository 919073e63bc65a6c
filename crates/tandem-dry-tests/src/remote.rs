// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory remote store with nested fetches and version guards.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tandem_query::{compare_rows, PageRange, QueryNode};
use tandem_schema::{Cardinality, Row, Schema, PRIMARY_KEY, UPDATED_AT, VERSION};
use tandem_store_port::{ChannelEvent, ChannelMessage, PubSub, RemoteError, RemoteStore, VersionGuard};

use crate::pubsub::MemoryPubSub;

/// Error code returned when a version guard does not hold.
pub const CONFLICT_CODE: &str = "409";
/// Error code returned when an update targets a missing row.
pub const NOT_FOUND_CODE: &str = "PGRST116";
/// Error code returned when an insert reuses a primary key.
pub const DUPLICATE_CODE: &str = "23505";

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    offline: bool,
    fetches: usize,
    lookups: usize,
    inserts: usize,
    updates: usize,
    deletes: usize,
}

/// In-memory [`RemoteStore`] over column-space rows.
///
/// Tables with a `version` column get an integer token bumped on every
/// write. When wired to a [`MemoryPubSub`], every write publishes to
/// `table:id:<id>` and to `table:<fk column>:<value>` for each foreign key.
#[derive(Clone)]
pub struct MemoryRemoteStore {
    schema: Arc<Schema>,
    inner: Arc<Mutex<Inner>>,
    pubsub: Option<MemoryPubSub>,
    inline_payloads: bool,
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("inline_payloads", &self.inline_payloads)
            .finish_non_exhaustive()
    }
}

fn id_of(row: &Row) -> Option<String> {
    match row.get(PRIMARY_KEY)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn run_node(tables: &Tables, node: &QueryNode, candidates: Vec<Row>, offset: usize, limit: Option<usize>) -> Vec<Row> {
    let mut rows: Vec<Row> = candidates
        .into_iter()
        .filter(|row| node.filter.as_ref().is_none_or(|f| f.matches(row)))
        .collect();
    rows.sort_by(|a, b| compare_rows(&node.sort, a, b));
    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .map(|mut row| {
            for child in &node.children {
                let (Some(relation), Some(edge)) = (&child.relation, &child.edge) else {
                    continue;
                };
                let related: Vec<Row> = match row.get(&edge.local_column) {
                    Some(key) if !key.is_null() => tables
                        .get(&child.table)
                        .into_iter()
                        .flat_map(BTreeMap::values)
                        .filter(|candidate| candidate.get(&edge.foreign_column) == Some(key))
                        .cloned()
                        .collect(),
                    _ => Vec::new(),
                };
                let embedded = run_node(tables, child, related, child.offset.unwrap_or(0), child.limit);
                let value = match edge.cardinality {
                    Cardinality::OneToMany => Value::Array(embedded.into_iter().map(Value::Object).collect()),
                    Cardinality::ManyToOne => embedded.into_iter().next().map_or(Value::Null, Value::Object),
                };
                row.insert(relation.clone(), value);
            }
            row
        })
        .collect()
}

impl MemoryRemoteStore {
    /// Create an empty store for `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            inner: Arc::new(Mutex::new(Inner::default())),
            pubsub: None,
            inline_payloads: true,
        }
    }

    /// Publish a change message for every write.
    pub fn with_pubsub(mut self, pubsub: MemoryPubSub) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Whether change messages carry the row inline (default) or only headers.
    pub fn with_inline_payloads(mut self, inline: bool) -> Self {
        self.inline_payloads = inline;
        self
    }

    /// Store a row directly (no version bump, no publish).
    pub fn seed(&self, table: &str, row: Row) {
        if let Some(id) = id_of(&row) {
            self.lock().tables.entry(table.to_string()).or_default().insert(id, row);
        }
    }

    /// Current row, if any.
    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.lock().tables.get(table).and_then(|rows| rows.get(id)).cloned()
    }

    /// Number of rows in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Whether `table` is empty.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Simulate another client writing `patch` (bumps the version, publishes).
    pub async fn server_update(&self, table: &str, id: &str, patch: Row) -> Option<Row> {
        let stored = self.apply_update(table, id, patch)?;
        self.publish(table, ChannelEvent::Update, &stored).await;
        Some(stored)
    }

    /// Simulate another client deleting a row (publishes).
    pub async fn server_delete(&self, table: &str, id: &str) -> Option<Row> {
        let removed = self.lock().tables.get_mut(table)?.remove(id)?;
        self.publish(table, ChannelEvent::Delete, &removed).await;
        Some(removed)
    }

    /// Remove a row silently (no publish), as if the deletion was missed.
    pub fn forget(&self, table: &str, id: &str) {
        if let Some(rows) = self.lock().tables.get_mut(table) {
            rows.remove(id);
        }
    }

    /// Fail every call with a transport error while `offline`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Number of `fetch` calls.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    /// Number of `fetch_by_id` calls.
    pub fn lookup_count(&self) -> usize {
        self.lock().lookups
    }

    /// Number of `insert` calls.
    pub fn insert_count(&self) -> usize {
        self.lock().inserts
    }

    /// Number of `update` calls.
    pub fn update_count(&self) -> usize {
        self.lock().updates
    }

    /// Number of `delete` calls.
    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_version(&self, table: &str) -> bool {
        self.schema.table(table).is_ok_and(|t| t.has_version())
    }

    fn online(inner: &Inner) -> Result<(), RemoteError> {
        if inner.offline {
            Err(RemoteError::transport("remote unreachable"))
        } else {
            Ok(())
        }
    }

    fn apply_update(&self, table: &str, id: &str, patch: Row) -> Option<Row> {
        let versioned = self.has_version(table);
        let mut inner = self.lock();
        let row = inner.tables.get_mut(table)?.get_mut(id)?;
        row.extend(patch);
        if versioned {
            let next = row.get(VERSION).and_then(Value::as_i64).unwrap_or(0) + 1;
            row.insert(VERSION.to_string(), Value::from(next));
        }
        Some(row.clone())
    }

    async fn publish(&self, table: &str, event: ChannelEvent, row: &Row) {
        let (Some(pubsub), Some(id)) = (&self.pubsub, id_of(row)) else {
            return;
        };
        let mut message = ChannelMessage::new(event, &id);
        if let Some(updated_at) = row.get(UPDATED_AT).and_then(Value::as_str) {
            message = message.with_updated_at(updated_at);
        }
        if self.inline_payloads && event != ChannelEvent::Delete {
            message = message.with_payload(row.clone());
        }
        let mut channels = vec![format!("{table}:id:{id}")];
        if let Ok(descriptor) = self.schema.table(table) {
            for fk in &descriptor.foreign_keys {
                if let Some(value) = row.get(&fk.column).filter(|v| !v.is_null()) {
                    channels.push(format!("{table}:{}:{}", fk.column, render(value)));
                }
            }
        }
        for channel in channels {
            let _ = pubsub.publish(&channel, message.clone()).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(&self, query: &QueryNode, range: PageRange) -> Result<Vec<Row>, RemoteError> {
        let mut inner = self.lock();
        inner.fetches += 1;
        Self::online(&inner)?;
        let candidates: Vec<Row> = inner
            .tables
            .get(&query.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        Ok(run_node(&inner.tables, query, candidates, range.offset, Some(range.limit)))
    }

    async fn fetch_by_id(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError> {
        let mut inner = self.lock();
        inner.lookups += 1;
        Self::online(&inner)?;
        Ok(inner.tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, RemoteError> {
        let versioned = self.has_version(table);
        let stored = {
            let mut inner = self.lock();
            inner.inserts += 1;
            Self::online(&inner)?;
            let id = id_of(&row).ok_or_else(|| RemoteError::coded("23502", "null value in column \"id\""))?;
            let rows = inner.tables.entry(table.to_string()).or_default();
            if rows.contains_key(&id) {
                return Err(RemoteError::coded(DUPLICATE_CODE, format!("duplicate key `{id}`")));
            }
            if versioned {
                row.insert(VERSION.to_string(), Value::from(1));
            }
            rows.insert(id, row.clone());
            row
        };
        self.publish(table, ChannelEvent::Insert, &stored).await;
        Ok(stored)
    }

    async fn update(&self, table: &str, id: &str, patch: Row, guard: Option<VersionGuard>) -> Result<Row, RemoteError> {
        {
            let mut inner = self.lock();
            inner.updates += 1;
            Self::online(&inner)?;
            let current = inner
                .tables
                .get(table)
                .and_then(|rows| rows.get(id))
                .ok_or_else(|| RemoteError::coded(NOT_FOUND_CODE, format!("no row `{id}` in `{table}`")))?;
            if let Some(guard) = guard {
                if current.get(&guard.column) != Some(&guard.expected) {
                    return Err(RemoteError::coded(
                        CONFLICT_CODE,
                        format!("`{table}.{}` no longer matches {}", guard.column, guard.expected),
                    ));
                }
            }
        }
        let stored = self
            .apply_update(table, id, patch)
            .ok_or_else(|| RemoteError::coded(NOT_FOUND_CODE, format!("no row `{id}` in `{table}`")))?;
        self.publish(table, ChannelEvent::Update, &stored).await;
        Ok(stored)
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let removed = {
            let mut inner = self.lock();
            inner.deletes += 1;
            Self::online(&inner)?;
            inner.tables.get_mut(table).and_then(|rows| rows.remove(id))
        };
        if let Some(row) = removed {
            self.publish(table, ChannelEvent::Delete, &row).await;
        }
        Ok(())
    }
}
