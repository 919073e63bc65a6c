// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory local store that executes local join plans.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tandem_query::{compare_rows, flat_key, FlatRow, LocalJoin, LocalPlan};
use tandem_schema::{CollectionShape, Row};
use tandem_store_port::{LocalDocument, LocalStore, StoreChange, StoreError};
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Collection {
    shape: Option<CollectionShape>,
    version: u32,
    docs: BTreeMap<String, LocalDocument>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, Collection>,
    upserts: usize,
    queries: usize,
    resets: usize,
}

/// In-memory [`LocalStore`].
///
/// Root filter, sort and window run before the joins; joins are left joins
/// with the join filter applied to child rows only. Documents are checked
/// against the collection shape on every write.
#[derive(Clone)]
pub struct MemoryLocalStore {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLocalStore").finish_non_exhaustive()
    }
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
        }
    }

    /// Pre-populate `table` as if a previous run had stored `docs` under
    /// schema `version` (no shape checks).
    pub fn seed(&self, table: &str, version: u32, docs: Vec<LocalDocument>) {
        let mut inner = self.lock();
        let collection = inner.collections.entry(table.to_string()).or_insert_with(|| Collection {
            shape: None,
            version,
            docs: BTreeMap::new(),
        });
        collection.version = version;
        for doc in docs {
            collection.docs.insert(doc.id.clone(), doc);
        }
    }

    /// Snapshot of one document.
    pub fn document(&self, table: &str, id: &str) -> Option<LocalDocument> {
        self.lock()
            .collections
            .get(table)
            .and_then(|c| c.docs.get(id))
            .cloned()
    }

    /// Schema version `table` is stored under.
    pub fn version(&self, table: &str) -> Option<u32> {
        self.lock().collections.get(table).map(|c| c.version)
    }

    /// Number of documents in `table`, tombstones included.
    pub fn len(&self, table: &str) -> usize {
        self.lock().collections.get(table).map_or(0, |c| c.docs.len())
    }

    /// Whether `table` holds no documents.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// Number of successful writes.
    pub fn upsert_count(&self) -> usize {
        self.lock().upserts
    }

    /// Number of executed plans.
    pub fn query_count(&self) -> usize {
        self.lock().queries
    }

    /// Number of resets.
    pub fn reset_count(&self) -> usize {
        self.lock().resets
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, table: &str, id: &str) {
        let _ = self.changes.send(StoreChange {
            table: table.to_string(),
            id: id.to_string(),
        });
    }
}

fn json_kind(value: &Value) -> &'static [&'static str] {
    match value {
        Value::Null => &["null"],
        Value::Bool(_) => &["boolean"],
        Value::Number(n) if n.is_i64() || n.is_u64() => &["integer", "number"],
        Value::Number(_) => &["number"],
        Value::String(_) => &["string"],
        Value::Object(_) | Value::Array(_) => &["object"],
    }
}

fn check_shape(shape: &CollectionShape, doc: &LocalDocument) -> Result<(), String> {
    if doc.id.is_empty() {
        return Err("empty primary key".into());
    }
    for (property, value) in &doc.fields {
        let Some(expected) = shape.properties.get(property) else {
            return Err(format!("unknown property `{property}`"));
        };
        if !json_kind(value).iter().any(|kind| expected.types.contains(kind)) {
            return Err(format!("`{property}` does not accept {value}"));
        }
    }
    if doc.deleted {
        return Ok(());
    }
    match shape
        .required
        .iter()
        .find(|p| p.as_str() != shape.primary_key && !doc.fields.contains_key(p.as_str()))
    {
        Some(missing) => Err(format!("missing required `{missing}`")),
        None => Ok(()),
    }
}

fn live_rows<'a>(collection: Option<&'a Collection>) -> impl Iterator<Item = Row> + 'a {
    collection
        .into_iter()
        .flat_map(|c| c.docs.values())
        .filter(|doc| !doc.deleted)
        .map(LocalDocument::to_row)
}

fn prefixed<'a>(alias: &str, doc: &'a Row) -> impl Iterator<Item = (String, Value)> + 'a {
    let alias = alias.to_string();
    doc.iter().map(move |(k, v)| (flat_key(&alias, k), v.clone()))
}

fn join_rows(inner: &Inner, join: &LocalJoin, rows: Vec<FlatRow>) -> Vec<FlatRow> {
    let children: Vec<Row> = live_rows(inner.collections.get(&join.table))
        .filter(|child| join.filter.as_ref().is_none_or(|f| f.matches(child)))
        .collect();
    let parent_key = flat_key(&join.parent_alias, &join.parent_property);
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let matches: Vec<&Row> = match row.get(&parent_key) {
            Some(value) if !value.is_null() => children
                .iter()
                .filter(|child| child.get(&join.child_property) == Some(value))
                .collect(),
            _ => Vec::new(),
        };
        if matches.is_empty() {
            out.push(row);
            continue;
        }
        for child in matches {
            let mut joined = row.clone();
            joined.extend(prefixed(&join.alias, child));
            out.push(joined);
        }
    }
    out
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn create_collection(&self, table: &str, shape: &CollectionShape) -> Result<Option<u32>, StoreError> {
        let mut inner = self.lock();
        let previous = inner.collections.get(table).map(|c| c.version);
        let collection = inner.collections.entry(table.to_string()).or_insert_with(|| Collection {
            shape: None,
            version: shape.version,
            docs: BTreeMap::new(),
        });
        collection.version = shape.version;
        collection.shape = Some(shape.clone());
        Ok(previous)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.collections.clear();
        inner.resets += 1;
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<LocalDocument>, StoreError> {
        let inner = self.lock();
        let collection = inner
            .collections
            .get(table)
            .ok_or_else(|| StoreError::UnknownCollection(table.to_string()))?;
        Ok(collection.docs.get(id).cloned())
    }

    async fn upsert(&self, table: &str, document: LocalDocument) -> Result<(), StoreError> {
        let id = document.id.clone();
        {
            let mut inner = self.lock();
            let collection = inner
                .collections
                .get_mut(table)
                .ok_or_else(|| StoreError::UnknownCollection(table.to_string()))?;
            if let Some(shape) = &collection.shape {
                check_shape(shape, &document).map_err(|reason| StoreError::Rejected {
                    table: table.to_string(),
                    id: id.clone(),
                    reason,
                })?;
            }
            collection.docs.insert(id.clone(), document);
            inner.upserts += 1;
        }
        self.notify(table, &id);
        Ok(())
    }

    async fn remove(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let removed = {
            let mut inner = self.lock();
            let collection = inner
                .collections
                .get_mut(table)
                .ok_or_else(|| StoreError::UnknownCollection(table.to_string()))?;
            collection.docs.remove(id).is_some()
        };
        if removed {
            self.notify(table, id);
        }
        Ok(())
    }

    async fn all(&self, table: &str) -> Result<Vec<LocalDocument>, StoreError> {
        let inner = self.lock();
        let collection = inner
            .collections
            .get(table)
            .ok_or_else(|| StoreError::UnknownCollection(table.to_string()))?;
        Ok(collection.docs.values().cloned().collect())
    }

    async fn query(&self, plan: &LocalPlan) -> Result<Vec<FlatRow>, StoreError> {
        let mut inner = self.lock();
        inner.queries += 1;
        let collection = inner
            .collections
            .get(&plan.table)
            .ok_or_else(|| StoreError::UnknownCollection(plan.table.clone()))?;
        let mut roots: Vec<Row> = live_rows(Some(collection))
            .filter(|doc| plan.selector.as_ref().is_none_or(|s| s.matches(doc)))
            .collect();
        roots.sort_by(|a, b| compare_rows(&plan.sort, a, b));
        let mut rows: Vec<FlatRow> = roots
            .iter()
            .skip(plan.offset.unwrap_or(0))
            .take(plan.limit.unwrap_or(usize::MAX))
            .map(|doc| prefixed(&plan.alias, doc).collect())
            .collect();
        for join in &plan.joins {
            rows = join_rows(&inner, join, rows);
        }
        Ok(rows)
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
