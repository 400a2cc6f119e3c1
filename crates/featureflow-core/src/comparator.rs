//! C1 — Value Comparator.
//!
//! Applies a single [`Operator`] to an `(actual, expected)` pair. Pure
//! and total: every operator either returns `true`/`false` or falls
//! through to the "unknown operator" / "regex compile failure" path,
//! which logs a warning and returns `false` (spec §4.1, §7 — predicates
//! never panic or propagate an error).

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// The closed operator set from spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "==_ci")]
    EqCi,
    #[serde(rename = "!=_ci")]
    NeCi,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "contains_ci")]
    ContainsCi,
    #[serde(rename = "starts_with")]
    StartsWith,
    #[serde(rename = "starts_with_ci")]
    StartsWithCi,
    #[serde(rename = "ends_with")]
    EndsWith,
    #[serde(rename = "ends_with_ci")]
    EndsWithCi,
    #[serde(rename = "regex")]
    Regex,
    /// Any operator string outside the closed vocabulary above. Parsing
    /// never fails on it — the containing predicate simply evaluates to
    /// `false` with a warning logged (spec §4.1, §7 "Evaluation
    /// anomalies": a malformed operator must not fail the whole rule
    /// document).
    #[serde(other)]
    Unknown,
}

impl Default for Operator {
    /// Event name-match conditions default to `==` when no operator is
    /// specified (spec §3 "Event condition").
    fn default() -> Self {
        Operator::Eq
    }
}

const REGEX_CACHE_CAPACITY: usize = 256;

fn regex_cache() -> &'static Mutex<LruCache<String, Option<Regex>>> {
    static CACHE: OnceLock<Mutex<LruCache<String, Option<Regex>>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(LruCache::new(NonZeroUsize::new(REGEX_CACHE_CAPACITY).unwrap()))
    })
}

fn compiled_regex(pattern: &str) -> Option<Regex> {
    let mut cache = regex_cache().lock().expect("regex cache lock poisoned");
    if let Some(hit) = cache.get(pattern) {
        return hit.clone();
    }
    let compiled = Regex::new(pattern).ok();
    cache.put(pattern.to_string(), compiled.clone());
    compiled
}

/// Apply `operator` to `(actual, expected)`. Never panics; unknown
/// operators and regex compile failures return `false` and log a
/// warning (spec §4.1).
pub fn compare(actual: &Value, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Eq => actual.as_str_form() == expected.as_str_form(),
        Operator::Ne => actual.as_str_form() != expected.as_str_form(),
        Operator::EqCi => eq_ci(actual, expected),
        Operator::NeCi => !eq_ci(actual, expected),
        Operator::Lt => order(actual, expected, |o| o == std::cmp::Ordering::Less),
        Operator::Le => order(actual, expected, |o| o != std::cmp::Ordering::Greater),
        Operator::Gt => order(actual, expected, |o| o == std::cmp::Ordering::Greater),
        Operator::Ge => order(actual, expected, |o| o != std::cmp::Ordering::Less),
        Operator::In => membership(actual, expected, true),
        Operator::NotIn => membership(actual, expected, false),
        Operator::Contains => actual
            .as_str_form()
            .to_lowercase()
            .contains(&expected.as_str_form().to_lowercase()),
        Operator::ContainsCi => actual
            .as_str_form()
            .to_lowercase()
            .contains(&expected.as_str_form().to_lowercase()),
        Operator::StartsWith => actual
            .as_str_form()
            .starts_with(&expected.as_str_form()),
        Operator::StartsWithCi => actual
            .as_str_form()
            .to_lowercase()
            .starts_with(&expected.as_str_form().to_lowercase()),
        Operator::EndsWith => actual.as_str_form().ends_with(&expected.as_str_form()),
        Operator::EndsWithCi => actual
            .as_str_form()
            .to_lowercase()
            .ends_with(&expected.as_str_form().to_lowercase()),
        Operator::Regex => {
            let pattern = expected.as_str_form();
            match compiled_regex(&pattern) {
                Some(re) => re.is_match(&actual.as_str_form()),
                None => {
                    tracing::warn!(pattern = %pattern, "regex compile failure — predicate returns false");
                    false
                }
            }
        }
        Operator::Unknown => {
            tracing::warn!("unknown operator — predicate returns false");
            false
        }
    }
}

fn eq_ci(actual: &Value, expected: &Value) -> bool {
    actual.as_str_form().to_lowercase() == expected.as_str_form().to_lowercase()
}

/// Ordering operators first attempt numeric parsing of both sides; if
/// both parse as finite numbers, numeric comparison applies, otherwise
/// lexicographic ordering applies (spec §4.1).
fn order(actual: &Value, expected: &Value, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    let ordering = match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => actual
            .as_str_form()
            .partial_cmp(&expected.as_str_form()),
    };
    match ordering {
        Some(o) => accept(o),
        None => false,
    }
}

fn membership(actual: &Value, expected: &Value, want_present: bool) -> bool {
    let needle = actual.as_str_form().to_lowercase();
    let present = expected
        .as_membership_list()
        .iter()
        .any(|candidate| candidate.to_lowercase() == needle);
    present == want_present
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Value {
        Value::from(v)
    }

    #[test]
    fn eq_and_ne_are_byte_exact() {
        assert!(compare(&s("Beta"), Operator::Eq, &s("Beta")));
        assert!(!compare(&s("Beta"), Operator::Eq, &s("beta")));
        assert!(compare(&s("Beta"), Operator::Ne, &s("beta")));
    }

    #[test]
    fn ci_variants_lowercase_both_sides() {
        assert!(compare(&s("Beta"), Operator::EqCi, &s("beta")));
        assert!(!compare(&s("Beta"), Operator::NeCi, &s("beta")));
    }

    #[test]
    fn ordering_prefers_numeric_when_both_parse() {
        assert!(compare(&s("10"), Operator::Gt, &s("9")));
        // Lexicographic would say "10" < "9"; numeric says the opposite.
        assert!(!compare(&s("10"), Operator::Lt, &s("9")));
    }

    #[test]
    fn ordering_falls_back_to_lexicographic() {
        assert!(compare(&s("banana"), Operator::Gt, &s("apple")));
    }

    #[test]
    fn in_and_not_in_are_case_insensitive_and_split_commas() {
        let expected = s("Beta, Admin, qa");
        assert!(compare(&s("beta"), Operator::In, &expected));
        assert!(!compare(&s("guest"), Operator::In, &expected));
        assert!(compare(&s("guest"), Operator::NotIn, &expected));
    }

    #[test]
    fn in_with_array_expected() {
        let expected = Value::Array(vec![s("beta"), s("admin")]);
        assert!(compare(&s("ADMIN"), Operator::In, &expected));
    }

    #[test]
    fn contains_is_case_insensitive_substring() {
        assert!(compare(&s("Hello World"), Operator::Contains, &s("world")));
        assert!(!compare(&s("Hello World"), Operator::Contains, &s("xyz")));
    }

    #[test]
    fn starts_and_ends_with_variants() {
        assert!(compare(&s("feature_x"), Operator::StartsWith, &s("feature_")));
        assert!(!compare(&s("feature_x"), Operator::StartsWith, &s("Feature_")));
        assert!(compare(&s("feature_x"), Operator::StartsWithCi, &s("Feature_")));
        assert!(compare(&s("feature_x"), Operator::EndsWith, &s("_x")));
        assert!(compare(&s("feature_X"), Operator::EndsWithCi, &s("_x")));
    }

    #[test]
    fn regex_matches_and_caches() {
        assert!(compare(&s("v2.3.1"), Operator::Regex, &s(r"^v\d+\.\d+\.\d+$")));
        assert!(!compare(&s("nope"), Operator::Regex, &s(r"^v\d+\.\d+\.\d+$")));
        // Second call hits the compiled-regex cache path.
        assert!(compare(&s("v9.9.9"), Operator::Regex, &s(r"^v\d+\.\d+\.\d+$")));
    }

    #[test]
    fn bad_regex_returns_false_not_panic() {
        assert!(!compare(&s("anything"), Operator::Regex, &s("(unclosed")));
    }

    #[test]
    fn unrecognized_operator_string_parses_to_unknown_and_returns_false() {
        let parsed: Operator = serde_json::from_str("\"frobnicate\"").unwrap();
        assert_eq!(parsed, Operator::Unknown);
        assert!(!compare(&s("x"), parsed, &s("y")));
    }
}
