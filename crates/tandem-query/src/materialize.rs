// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Result materializer: flat join rows → hierarchical documents.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tandem_schema::{Cardinality, Row, PENDING_PROPERTY, PRIMARY_KEY};

use crate::local::{FlatRow, LocalPlan};
use crate::sort::compare_rows;

/// String form of a primary-key value (strings verbatim, numbers rendered).
pub(crate) fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract(row: &FlatRow, alias: &str) -> Option<Row> {
    let prefix = format!("{alias}.");
    let doc: Row = row
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|property| (property.to_string(), value.clone()))
        })
        .collect();
    doc.get(PRIMARY_KEY).and_then(id_key).map(|_| doc)
}

fn alias_id(row: &FlatRow, alias: &str) -> Option<String> {
    row.get(&format!("{alias}.{PRIMARY_KEY}")).and_then(id_key)
}

/// Group `rows` by the id under `alias`, keeping first-seen order.
fn group_by_id<'r>(rows: &[&'r FlatRow], alias: &str) -> Vec<Vec<&'r FlatRow>> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<&'r FlatRow>> = Vec::new();
    for row in rows {
        let Some(id) = alias_id(row, alias) else { continue };
        let slot = *slots.entry(id).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(*row);
    }
    groups
}

fn build(plan: &LocalPlan, alias: &str, rows: &[&FlatRow]) -> Option<Row> {
    let mut doc = extract(rows.first()?, alias)?;
    for join in plan.joins_of(alias) {
        let mut children: Vec<Row> = group_by_id(rows, &join.alias)
            .iter()
            .filter_map(|group| build(plan, &join.alias, group))
            .collect();
        children.sort_by(|a, b| compare_rows(&join.sort, a, b));
        let window = children
            .into_iter()
            .skip(join.offset.unwrap_or(0))
            .take(join.limit.unwrap_or(usize::MAX));
        let value = match join.cardinality {
            Cardinality::OneToMany => Value::Array(window.map(Value::Object).collect()),
            Cardinality::ManyToOne => window.map(Value::Object).next().unwrap_or(Value::Null),
        };
        doc.insert(join.relation.clone(), value);
    }
    Some(doc)
}

/// Fold the engine's flat join rows into one document per root row.
///
/// Roots keep first-seen order (the engine already applied root sort and
/// window). Each relation is deduplicated by id, then sorted, offset and
/// limited per parent. One-to-many relations become arrays, many-to-one
/// relations the single match or `null`.
pub fn materialize(rows: &[FlatRow], plan: &LocalPlan) -> Vec<Row> {
    let refs: Vec<&FlatRow> = rows.iter().collect();
    group_by_id(&refs, &plan.alias)
        .iter()
        .filter_map(|group| build(plan, &plan.alias, group))
        .collect()
}

/// Primary keys present in a (materialized) result, per table, with their
/// pending flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityIndex {
    tables: BTreeMap<String, BTreeMap<String, bool>>,
}

impl EntityIndex {
    /// Record `table`/`id`; a pending sighting wins over a confirmed one.
    pub fn insert(&mut self, table: &str, id: &str, pending: bool) {
        let slot = self
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert(pending);
        *slot |= pending;
    }

    /// Whether `table`/`id` was seen.
    pub fn contains(&self, table: &str, id: &str) -> bool {
        self.tables.get(table).is_some_and(|ids| ids.contains_key(id))
    }

    /// Whether `table`/`id` was seen with a pending mutation.
    pub fn is_pending(&self, table: &str, id: &str) -> bool {
        self.tables
            .get(table)
            .and_then(|ids| ids.get(id))
            .copied()
            .unwrap_or(false)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    /// Whether no entity was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All `(table, id, pending)` entries, ordered.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.tables.iter().flat_map(|(table, ids)| {
            ids.iter()
                .map(move |(id, pending)| (table.as_str(), id.as_str(), *pending))
        })
    }

    /// Non-pending entries of `self` that `fresh` does not contain.
    pub fn missing_from(&self, fresh: &EntityIndex) -> Vec<(String, String)> {
        self.iter()
            .filter(|(table, id, pending)| !pending && !fresh.contains(table, id))
            .map(|(table, id, _)| (table.to_string(), id.to_string()))
            .collect()
    }
}

fn collect_into(index: &mut EntityIndex, plan: &LocalPlan, alias: &str, table: &str, doc: &Row) {
    let Some(id) = doc.get(PRIMARY_KEY).and_then(id_key) else {
        return;
    };
    let pending = doc.get(PENDING_PROPERTY).and_then(Value::as_bool).unwrap_or(false);
    index.insert(table, &id, pending);
    for join in plan.joins_of(alias) {
        match doc.get(&join.relation) {
            Some(Value::Array(items)) => {
                for item in items.iter().filter_map(Value::as_object) {
                    collect_into(index, plan, &join.alias, &join.table, item);
                }
            }
            Some(Value::Object(item)) => collect_into(index, plan, &join.alias, &join.table, item),
            _ => {}
        }
    }
}

/// Index every entity (root and nested) of hierarchical `docs` shaped by `plan`.
pub fn collect_entities(docs: &[Row], plan: &LocalPlan) -> EntityIndex {
    let mut index = EntityIndex::default();
    for doc in docs {
        collect_into(&mut index, plan, &plan.alias, &plan.table, doc);
    }
    index
}
