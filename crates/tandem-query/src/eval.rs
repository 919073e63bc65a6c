// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Value comparison shared by predicate evaluation and row ordering.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

use crate::sort::Collation;

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse the timestamp renderings a relational store emits.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Compare two non-null values under `collation`.
///
/// Returns `None` when either side is null or the values are not comparable
/// (mixed kinds). Integers compare exactly; other numbers as `f64`. Under
/// [`Collation::Numeric`] numeric strings compare as numbers, and under
/// [`Collation::Timestamp`] strings compare as instants. Strings that do not
/// parse order after every string that does, and lexically among themselves.
pub fn compare_values(a: &Value, b: &Value, collation: Collation) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => Some(x.as_f64()?.total_cmp(&y.as_f64()?)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(match collation {
            Collation::Timestamp => parsed_first(parse_timestamp(x), parse_timestamp(y), x, y),
            Collation::Numeric => match (number(a), number(b)) {
                (Some(n), Some(m)) => n.total_cmp(&m),
                (n, m) => parsed_first(n.map(|_| ()), m.map(|_| ()), x, y),
            },
            Collation::Binary | Collation::Boolean => x.cmp(y),
        }),
        (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::String(_))
            if collation == Collation::Numeric =>
        {
            Some(number(a)?.total_cmp(&number(b)?))
        }
        _ => None,
    }
}

fn parsed_first<T: Ord>(a: Option<T>, b: Option<T>, raw_a: &str, raw_b: &str) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => raw_a.cmp(raw_b),
    }
}

/// Total order over non-null values for sorting.
///
/// Comparable values use [`compare_values`]; the rest order by kind:
/// booleans, numbers, strings, arrays, objects.
pub fn order_values(a: &Value, b: &Value, collation: Collation) -> Ordering {
    compare_values(a, b, collation).unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b)))
}

const fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// SQL `LIKE` matching: `%` matches any run, `_` exactly one character,
/// `\` escapes the next character.
pub fn like_match(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Token {
        Any,
        One,
        Lit(char),
    }
    let fold = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.chars().flat_map(char::to_lowercase).collect()
        } else {
            s.chars().collect()
        }
    };
    let mut tokens = Vec::new();
    let mut chars = fold(pattern).into_iter();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => Token::Any,
            '_' => Token::One,
            '\\' => Token::Lit(chars.next().unwrap_or('\\')),
            other => Token::Lit(other),
        });
    }
    let text = fold(text);

    // reachable[j]: the pattern prefix consumed so far can end at text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for token in tokens {
        let mut next = vec![false; text.len() + 1];
        match token {
            Token::Any => {
                let mut seen = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    seen |= reachable[j];
                    *slot = seen;
                }
            }
            Token::One | Token::Lit(_) => {
                for j in 0..text.len() {
                    let fits = match token {
                        Token::Lit(c) => text[j] == c,
                        _ => true,
                    };
                    next[j + 1] = reachable[j] && fits;
                }
            }
        }
        reachable = next;
    }
    reachable[text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn like_wildcards_and_escapes() {
        assert!(like_match("a%c", "abbbc", false));
        assert!(like_match("a_c", "abc", false));
        assert!(!like_match("a_c", "abbc", false));
        assert!(like_match("%", "", false));
        assert!(like_match("100\\%", "100%", false));
        assert!(!like_match("100\\%", "1000", false));
        assert!(!like_match("ABC", "abc", false));
        assert!(like_match("ABC", "abc", true));
    }

    #[test]
    fn timestamps_compare_as_instants() {
        let a = json!("2024-01-01T10:00:00+02:00");
        let b = json!("2024-01-01T09:00:00Z");
        assert_eq!(compare_values(&a, &b, Collation::Timestamp), Some(Ordering::Less));
        assert_eq!(compare_values(&a, &b, Collation::Binary), Some(Ordering::Greater));
    }

    #[test]
    fn numbers_and_mixed_kinds() {
        assert_eq!(compare_values(&json!(2), &json!(10), Collation::Numeric), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("2.5"), &json!(10), Collation::Numeric), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("a"), &json!(1), Collation::Binary), None);
        assert_eq!(compare_values(&json!(null), &json!(1), Collation::Numeric), None);
    }

    #[test]
    fn unparseable_values_sort_after_parseable_ones() {
        let mut stamps = vec![
            json!("2024-01-01T10:00:00+02:00"),
            json!("2024-01-01T09:30"),
            json!("not a time"),
            json!("2024-01-01T09:00:00Z"),
            json!("2024-01-01"),
            json!("garbage"),
        ];
        stamps.sort_by(|a, b| order_values(a, b, Collation::Timestamp));
        assert_eq!(
            stamps,
            vec![
                json!("2024-01-01"),
                json!("2024-01-01T10:00:00+02:00"),
                json!("2024-01-01T09:00:00Z"),
                json!("2024-01-01T09:30"),
                json!("garbage"),
                json!("not a time"),
            ]
        );

        let mut mixed = vec![json!("x"), json!(3), json!("2"), json!(true), json!("abc"), json!(1.5), json!([1])];
        mixed.sort_by(|a, b| order_values(a, b, Collation::Numeric));
        assert_eq!(
            mixed,
            vec![json!(true), json!(1.5), json!("2"), json!(3), json!("abc"), json!("x"), json!([1])]
        );
    }

    #[test]
    fn ordering_is_consistent_across_every_pair() {
        let values = [
            json!("2024-01-01T10:00:00+02:00"),
            json!("2024-01-01T09:30"),
            json!("2024-01-01T09:00:00Z"),
            json!("zzz"),
            json!(7),
            json!("7"),
            json!(false),
            json!({"a": 1}),
        ];
        for collation in [Collation::Timestamp, Collation::Numeric, Collation::Binary] {
            for a in &values {
                for b in &values {
                    assert_eq!(order_values(a, b, collation), order_values(b, a, collation).reverse());
                    for c in &values {
                        let (ab, bc) = (order_values(a, b, collation), order_values(b, c, collation));
                        if ab != Ordering::Greater && bc != Ordering::Greater {
                            assert_ne!(order_values(a, c, collation), Ordering::Greater, "{a} {b} {c}");
                        }
                    }
                }
            }
        }
    }
}
