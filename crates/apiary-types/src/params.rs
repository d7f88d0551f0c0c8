//! Helpers for the free-form parameter bags carried by tasks and personas.
//!
//! Command parameters and persona traits arrive as arbitrary JSON objects
//! authored by other systems (and other languages), so key casing and value
//! shapes are not reliable: a flag may be `true`, `"True"`, or `1`, and a
//! list may be a single string or an array. The helpers here centralise the
//! lenient reads the intervention rules and command whitelist depend on.

use serde_json::Value;

/// Lenient accessors over a JSON object used as a parameter bag.
pub trait ParamBag {
    /// Looks up a key case-insensitively. Exact match wins when both exist.
    fn get_ci(&self, key: &str) -> Option<&Value>;

    /// Looks up a key case-insensitively and coerces the value to a string
    /// slice. Non-string values return `None`.
    fn get_str_ci(&self, key: &str) -> Option<&str>;

    /// Returns `true` when the value under `key` is affirmative: boolean
    /// `true`, the strings `"true"`/`"yes"`/`"1"` (any casing), or a
    /// non-zero integer. Missing keys and every other shape are `false`.
    fn flag_ci(&self, key: &str) -> bool;
}

impl ParamBag for Value {
    fn get_ci(&self, key: &str) -> Option<&Value> {
        let map = self.as_object()?;
        if let Some(v) = map.get(key) {
            return Some(v);
        }
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    fn get_str_ci(&self, key: &str) -> Option<&str> {
        self.get_ci(key).and_then(Value::as_str)
    }

    fn flag_ci(&self, key: &str) -> bool {
        self.get_ci(key).is_some_and(is_affirmative)
    }
}

/// Returns `true` for affirmative scalar values.
///
/// Recognises boolean `true`, `"true"`/`"yes"`/`"1"` strings in any
/// casing, and non-zero integers. `"false"`, `0`, `null`, arrays and
/// objects are all negative.
#[must_use]
pub fn is_affirmative(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or_else(|| {
            n.as_f64().map(|f| f != 0.0).unwrap_or(false)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes") || s == "1"
        }
        _ => false,
    }
}

/// Flattens a value into its string members.
///
/// A bare string yields itself; an array yields its string elements;
/// everything else yields nothing. Rule values in persona traits use both
/// shapes interchangeably.
#[must_use]
pub fn string_values(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_ci_prefers_exact_match() {
        let bag = json!({"Mode": "a", "mode": "b"});
        assert_eq!(bag.get_str_ci("mode"), Some("b"));
        assert_eq!(bag.get_str_ci("Mode"), Some("a"));
    }

    #[test]
    fn get_ci_falls_back_to_case_insensitive() {
        let bag = json!({"ParentCommandId": "c1"});
        assert_eq!(bag.get_str_ci("parentCommandId"), Some("c1"));
        assert_eq!(bag.get_str_ci("parentcommandid"), Some("c1"));
        assert_eq!(bag.get_str_ci("missing"), None);
    }

    #[test]
    fn get_ci_on_non_object_is_none() {
        assert!(json!("scalar").get_ci("key").is_none());
        assert!(json!(null).get_ci("key").is_none());
    }

    #[test]
    fn affirmative_shapes() {
        assert!(is_affirmative(&json!(true)));
        assert!(is_affirmative(&json!("true")));
        assert!(is_affirmative(&json!("TRUE")));
        assert!(is_affirmative(&json!("yes")));
        assert!(is_affirmative(&json!("1")));
        assert!(is_affirmative(&json!(1)));
        assert!(is_affirmative(&json!(-3)));

        assert!(!is_affirmative(&json!(false)));
        assert!(!is_affirmative(&json!("false")));
        assert!(!is_affirmative(&json!("no")));
        assert!(!is_affirmative(&json!(0)));
        assert!(!is_affirmative(&json!(null)));
        assert!(!is_affirmative(&json!(["true"])));
    }

    #[test]
    fn flag_ci_reads_through_bag() {
        let traits = json!({"RequireIntervention": "True"});
        assert!(traits.flag_ci("requireIntervention"));
        assert!(!traits.flag_ci("manualReview"));
    }

    #[test]
    fn string_values_flattens() {
        assert_eq!(string_values(&json!("a")), vec!["a"]);
        assert_eq!(string_values(&json!(["a", 1, "b"])), vec!["a", "b"]);
        assert!(string_values(&json!({"k": "v"})).is_empty());
        assert!(string_values(&json!(42)).is_empty());
    }
}
