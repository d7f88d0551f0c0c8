//! Intervention rule predicate.
//!
//! Decides whether a task must pause for an operator before it runs,
//! based on the persona's free-form traits and the target URL. Traits
//! are authored by hand across several systems, so every comparison is
//! case-insensitive and values may be scalars or lists.

use serde_json::Value;
use url::Url;

use apiary_types::{is_affirmative, string_values, ParamBag};

use crate::persona::Persona;

/// Trait flags that force intervention regardless of URL.
const FLAG_KEYS: &[&str] = &[
    "requireIntervention",
    "requiresIntervention",
    "alwaysRequireIntervention",
    "manualReview",
    "manual_review",
    "forceIntervention",
];

/// Trait keys holding domain suffix rules.
const DOMAIN_KEYS: &[&str] = &["domain", "domains", "host", "hosts", "interventionDomains"];

/// Trait keys holding path substring rules.
const PATH_KEYS: &[&str] = &["path", "paths", "interventionPaths"];

/// Trait keys holding full-URL substring rules.
const KEYWORD_KEYS: &[&str] = &["keyword", "keywords", "contains", "interventionKeywords"];

/// Trait key holding nested rule structures.
const NESTED_KEY: &str = "interventionRules";

/// Returns `true` when the persona demands operator intervention for
/// the given URL.
///
/// Matches, in this order: affirmative trait flags, URL host suffix
/// rules, URL path substring rules, full-URL keyword rules, and the
/// same rules recursively under `interventionRules` (objects or
/// sequences of objects).
#[must_use]
pub fn check_for_intervention(url: Option<&str>, persona: &Persona) -> bool {
    let target = url.map(UrlParts::parse);
    rules_match(&persona.traits, target.as_ref())
}

struct UrlParts {
    /// Whole URL, lower-cased.
    full: String,
    /// Host, lower-cased, when the URL parses.
    host: Option<String>,
    /// Path, lower-cased.
    path: String,
}

impl UrlParts {
    fn parse(url: &str) -> Self {
        match Url::parse(url) {
            Ok(parsed) => Self {
                full: url.to_lowercase(),
                host: parsed.host_str().map(str::to_lowercase),
                path: parsed.path().to_lowercase(),
            },
            Err(_) => Self {
                full: url.to_lowercase(),
                host: None,
                path: String::new(),
            },
        }
    }
}

fn rules_match(traits: &Value, url: Option<&UrlParts>) -> bool {
    let Some(map) = traits.as_object() else {
        return false;
    };

    if FLAG_KEYS.iter().any(|key| traits.flag_ci(key)) {
        return true;
    }

    for (key, value) in map {
        if key_in(key, DOMAIN_KEYS) && host_matches(value, url) {
            return true;
        }
        if key_in(key, PATH_KEYS) && path_matches(value, url) {
            return true;
        }
        if key_in(key, KEYWORD_KEYS) && keyword_matches(value, url) {
            return true;
        }
        if key.eq_ignore_ascii_case(NESTED_KEY) && nested_match(value, url) {
            return true;
        }
    }
    false
}

fn nested_match(value: &Value, url: Option<&UrlParts>) -> bool {
    match value {
        Value::Object(_) => rules_match(value, url),
        Value::Array(items) => items.iter().any(|item| nested_match(item, url)),
        other => is_affirmative(other),
    }
}

fn key_in(key: &str, candidates: &[&str]) -> bool {
    candidates.iter().any(|c| key.eq_ignore_ascii_case(c))
}

fn host_matches(value: &Value, url: Option<&UrlParts>) -> bool {
    let Some(host) = url.and_then(|u| u.host.as_deref()) else {
        return false;
    };
    string_values(value)
        .iter()
        .any(|rule| host.ends_with(&rule.to_lowercase()))
}

fn path_matches(value: &Value, url: Option<&UrlParts>) -> bool {
    let Some(url) = url else { return false };
    string_values(value)
        .iter()
        .any(|rule| !rule.is_empty() && url.path.contains(&rule.to_lowercase()))
}

fn keyword_matches(value: &Value, url: Option<&UrlParts>) -> bool {
    let Some(url) = url else { return false };
    string_values(value)
        .iter()
        .any(|rule| !rule.is_empty() && url.full.contains(&rule.to_lowercase()))
}
