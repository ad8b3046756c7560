//! Path queries over structured values.
//!
//! A query is a dot-delimited list of segments. A segment that parses as a
//! non-negative integer indexes a sequence; anything else is a key. Missing
//! keys and out-of-range indices are soft misses: a warning is logged and
//! `null` is returned. Navigating into a scalar is a hard error.

use crate::error::StepError;
use serde_json::Value;
use tracing::warn;

pub fn split_query(query: &str) -> Vec<&str> {
    query.split('.').collect()
}

pub fn parse_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

pub(crate) fn soft_miss(query: &str, reason: impl AsRef<str>) -> Value {
    warn!("failed to extract '{query}': {}, returning null", reason.as_ref());
    Value::Null
}

pub fn navigate(value: &Value, segments: &[&str], query: &str) -> Result<Value, StepError> {
    let mut current = value;
    for (position, segment) in segments.iter().enumerate() {
        match current {
            Value::Object(map) => match map.get(*segment) {
                Some(next) => current = next,
                None => return Ok(soft_miss(query, format!("key '{segment}' not found"))),
            },
            Value::Array(items) => {
                let index = parse_index(segment).ok_or_else(|| {
                    StepError::extract(format!(
                        "'{query}': sequence index must be numeric, got '{segment}'"
                    ))
                })?;
                match items.get(index) {
                    Some(next) => current = next,
                    None => {
                        return Ok(soft_miss(
                            query,
                            format!("index {index} out of range (len {})", items.len()),
                        ))
                    }
                }
            }
            Value::String(text) => {
                let index = parse_index(segment).ok_or_else(|| {
                    StepError::extract(format!(
                        "'{query}': cannot look up '{segment}' in text value"
                    ))
                })?;
                return match text.chars().nth(index) {
                    Some(c) => navigate(
                        &Value::String(c.to_string()),
                        &segments[position + 1..],
                        query,
                    ),
                    None => Ok(soft_miss(
                        query,
                        format!("index {index} out of range for text"),
                    )),
                };
            }
            scalar => {
                return Err(StepError::extract(format!(
                    "'{query}': cannot look up '{segment}' in scalar value {scalar}"
                )))
            }
        }
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(value: &Value, q: &str) -> Result<Value, StepError> {
        let segments = split_query(q);
        navigate(value, &segments, q)
    }

    #[test]
    fn walks_objects_and_sequences() {
        let body = json!({"data": {"users": [{"id": 7}, {"id": 9}]}});
        assert_eq!(query(&body, "data.users.1.id").expect("hit"), json!(9));
        assert_eq!(query(&body, "data.users").expect("hit"), json!([{"id": 7}, {"id": 9}]));
    }

    #[test]
    fn missing_keys_and_indices_are_soft_misses() {
        let body = json!({"data": {"users": [{"id": 7}]}});
        assert_eq!(query(&body, "data.missing").expect("soft"), Value::Null);
        assert_eq!(query(&body, "data.users.4.id").expect("soft"), Value::Null);
    }

    #[test]
    fn scalar_leaf_with_key_is_a_hard_error() {
        let body = json!({"count": 3, "names": ["a"]});
        assert!(matches!(query(&body, "count.total"), Err(StepError::Extract(_))));
        assert!(matches!(query(&body, "names.first"), Err(StepError::Extract(_))));
    }

    #[test]
    fn text_is_indexed_by_character() {
        let body = json!({"code": "abc"});
        assert_eq!(query(&body, "code.1").expect("hit"), json!("b"));
        assert!(matches!(query(&body, "code.x"), Err(StepError::Extract(_))));
    }

    #[test]
    fn index_parsing_rejects_signs_and_blanks() {
        assert_eq!(parse_index("12"), Some(12));
        assert_eq!(parse_index("-1"), None);
        assert_eq!(parse_index("+1"), None);
        assert_eq!(parse_index(""), None);
    }
}
