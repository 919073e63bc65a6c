// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Column ↔ local property name mapping.
//!
//! Remote columns are snake_case; local documents use camelCase properties.
//! Names that start with an underscore (`_deleted`) are local-only and pass
//! through untouched.

/// Convert a snake_case column name into its camelCase property name.
pub fn property_name(column: &str) -> String {
    if column.starts_with('_') {
        return column.to_string();
    }
    let mut out = String::with_capacity(column.len());
    let mut upper_next = false;
    for ch in column.chars() {
        if ch == '_' {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Convert a camelCase property name back into its snake_case column name.
pub fn column_name(property: &str) -> String {
    if property.starts_with('_') {
        return property.to_string();
    }
    let mut out = String::with_capacity(property.len() + 4);
    for ch in property.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_to_camel() {
        assert_eq!(property_name("author_id"), "authorId");
        assert_eq!(property_name("created_at"), "createdAt");
        assert_eq!(property_name("id"), "id");
        assert_eq!(property_name("a__b"), "aB");
    }

    #[test]
    fn underscore_prefixed_names_are_local_only() {
        assert_eq!(property_name("_deleted"), "_deleted");
        assert_eq!(column_name("_deleted"), "_deleted");
    }

    #[test]
    fn camel_to_snake() {
        assert_eq!(column_name("authorId"), "author_id");
        assert_eq!(column_name("updatedAt"), "updated_at");
        assert_eq!(column_name("title"), "title");
    }
}
