// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structural schema fingerprint.
//!
//! Two schemas share a fingerprint iff they declare the same tables, the same
//! columns (name, type, nullability, default) and the same foreign keys.
//! Column declaration order is not structural. The session persists the
//! fingerprint and resets the local replica when it changes.

use crate::types::Schema;

/// BLAKE3 hash over the canonical schema structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SchemaFingerprint(pub [u8; 32]);

impl SchemaFingerprint {
    /// Lowercase hex rendering (used for persistence).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex rendering produced by [`to_hex`](Self::to_hex).
    pub fn from_hex(text: &str) -> Option<Self> {
        let bytes = hex::decode(text).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl std::fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn put(hasher: &mut blake3::Hasher, text: &str) {
    hasher.update(&(text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}

impl Schema {
    /// Compute the structural fingerprint.
    pub fn fingerprint(&self) -> SchemaFingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tandem:schema:v1");
        for table in self.tables.values() {
            put(&mut hasher, &table.name);
            let mut columns: Vec<_> = table.columns.iter().collect();
            columns.sort_by(|a, b| a.name.cmp(&b.name));
            hasher.update(&(columns.len() as u64).to_le_bytes());
            for column in columns {
                put(&mut hasher, &column.name);
                put(&mut hasher, column.column_type.json_type());
                put(&mut hasher, &format!("{:?}", column.column_type));
                hasher.update(&[u8::from(column.nullable)]);
                put(&mut hasher, column.default.as_deref().unwrap_or(""));
                hasher.update(&[u8::from(column.default.is_some())]);
            }
            let mut keys: Vec<_> = table.foreign_keys.iter().collect();
            keys.sort();
            hasher.update(&(keys.len() as u64).to_le_bytes());
            for fk in keys {
                put(&mut hasher, &fk.column);
                put(&mut hasher, &fk.target_table);
                put(&mut hasher, &fk.target_column);
            }
        }
        SchemaFingerprint(*hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::{Schema, SchemaFingerprint};

    const A: &str = r#"{"tables": {"t": {"columns": [{"name": "id"}, {"name": "x", "type": "int4"}]}}}"#;
    const A_REORDERED: &str = r#"{"tables": {"t": {"columns": [{"name": "x", "type": "int4"}, {"name": "id"}]}}}"#;
    const B: &str = r#"{"tables": {"t": {"columns": [{"name": "id"}, {"name": "x", "type": "text"}]}}}"#;

    #[test]
    fn column_order_is_not_structural() {
        let a = Schema::from_json(A).unwrap().fingerprint();
        let a2 = Schema::from_json(A_REORDERED).unwrap().fingerprint();
        assert_eq!(a, a2);
    }

    #[test]
    fn type_change_changes_fingerprint() {
        let a = Schema::from_json(A).unwrap().fingerprint();
        let b = Schema::from_json(B).unwrap().fingerprint();
        assert_ne!(a, b);
    }

    #[test]
    fn hex_rendering_parses_back() {
        let a = Schema::from_json(A).unwrap().fingerprint();
        assert_eq!(SchemaFingerprint::from_hex(&a.to_hex()), Some(a));
        assert_eq!(SchemaFingerprint::from_hex("zz"), None);
    }
}
