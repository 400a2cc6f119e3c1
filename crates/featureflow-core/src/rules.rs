//! C5 — Rule Set and Indexes: a parsed rule document plus the four
//! inverted indexes built over it (spec §4.4).

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::condition::ConditionsSpec;
use crate::error::RuleDocError;

/// One entry in a feature's ordered rule list (spec §3 "Rule").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub value: String,
    #[serde(default)]
    pub conditions: ConditionsSpec,
}

/// The canonical wire shape: `{ "features": { name: [rule, ...] } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CanonicalDoc {
    features: BTreeMap<String, Vec<Rule>>,
}

/// Parsed rule document, independent of which wire shape it arrived in
/// (spec §4.4: "canonical shape with a `features` wrapper, and a legacy
/// shape that is the feature map at the top level").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    pub features: BTreeMap<String, Vec<Rule>>,
}

impl RuleDocument {
    /// Parse either wire shape. The canonical shape is tried first; a
    /// legacy top-level feature map is tried as the fallback
    /// (re-wrapped under `features`). Anything else is a hard parse
    /// failure — the caller (C7) retains the previously installed rule
    /// set on this error (spec §9 Open Question).
    pub fn parse(bytes: &[u8]) -> Result<Self, RuleDocError> {
        if let Ok(canonical) = serde_json::from_slice::<CanonicalDoc>(bytes) {
            return Ok(Self { features: canonical.features });
        }
        match serde_json::from_slice::<BTreeMap<String, Vec<Rule>>>(bytes) {
            Ok(features) if !features.is_empty() || bytes_look_like_object(bytes) => {
                Ok(Self { features })
            }
            Ok(_) => Err(RuleDocError::UnrecognizedShape),
            Err(source) => Err(RuleDocError::Json(source)),
        }
    }

    /// Deterministic content hash naming this document (spec §4.4,
    /// §3 "Pointer document" — `version` is the content hash).
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(&self.features).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }
}

fn bytes_look_like_object(bytes: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(bytes)
        .map(|v| v.is_object())
        .unwrap_or(false)
}

/// The four inverted indexes built once per rule-set replacement (spec
/// §4.4). Only `feature_to_rules` is consulted during evaluation; the
/// other three exist to support targeted re-evaluation and are
/// persisted alongside a content hash for staleness detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleIndexes {
    pub event_name_to_features: BTreeMap<String, HashSet<String>>,
    pub user_property_to_features: BTreeMap<String, HashSet<String>>,
    pub device_property_to_features: BTreeMap<String, HashSet<String>>,
    #[serde(skip)]
    feature_to_rules: HashMap<String, Vec<Rule>>,
    /// Hash of the `RuleDocument` these indexes were built from;
    /// compared against a freshly computed hash to detect staleness
    /// after a reload from persistence.
    pub built_from_hash: String,
}

impl RuleIndexes {
    /// Build all four indexes from a parsed document (spec §4.4).
    pub fn build(doc: &RuleDocument) -> Self {
        let mut event_name_to_features: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        let mut user_property_to_features: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        let mut device_property_to_features: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        let mut feature_to_rules: HashMap<String, Vec<Rule>> = HashMap::new();

        for (feature, rules) in &doc.features {
            feature_to_rules.insert(feature.clone(), rules.clone());
            for rule in rules {
                for event_cond in &rule.conditions.events.events {
                    event_name_to_features
                        .entry(event_cond.key.clone())
                        .or_default()
                        .insert(feature.clone());
                }
                for prop_cond in &rule.conditions.user_properties {
                    user_property_to_features
                        .entry(prop_cond.key.clone())
                        .or_default()
                        .insert(feature.clone());
                }
                for prop_cond in &rule.conditions.device {
                    device_property_to_features
                        .entry(prop_cond.key.clone())
                        .or_default()
                        .insert(feature.clone());
                }
            }
        }

        Self {
            event_name_to_features,
            user_property_to_features,
            device_property_to_features,
            feature_to_rules,
            built_from_hash: doc.content_hash(),
        }
    }

    /// Rules for one feature, in evaluation order, or empty if the
    /// feature has no active rules.
    pub fn rules_for_feature(&self, feature: &str) -> &[Rule] {
        self.feature_to_rules.get(feature).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All feature names with at least one rule.
    pub fn feature_names(&self) -> impl Iterator<Item = &String> {
        self.feature_to_rules.keys()
    }

    /// True if these indexes were built from a document whose content
    /// hash no longer matches `current_doc` — the persisted copy is
    /// stale and must be rebuilt (spec §4.4).
    pub fn is_stale_against(&self, current_doc: &RuleDocument) -> bool {
        self.built_from_hash != current_doc.content_hash()
    }
}

/// The active rule set: the parsed document, its content hash, and its
/// indexes, replaced atomically as a unit (spec §4.4 "Rules are
/// replaced atomically").
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub document: RuleDocument,
    pub content_hash: String,
    pub indexes: RuleIndexes,
}

impl RuleSet {
    pub fn from_document(document: RuleDocument) -> Self {
        let content_hash = document.content_hash();
        let indexes = RuleIndexes::build(&document);
        Self { document, content_hash, indexes }
    }

    pub fn empty() -> Self {
        Self::from_document(RuleDocument::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_legacy_shapes_parse_to_same_representation() {
        let canonical = br#"{"features":{"promo":[{"value":"v2","conditions":{}}]}}"#;
        let legacy = br#"{"promo":[{"value":"v2","conditions":{}}]}"#;
        let canonical_doc = RuleDocument::parse(canonical).unwrap();
        let legacy_doc = RuleDocument::parse(legacy).unwrap();
        assert_eq!(canonical_doc.content_hash(), legacy_doc.content_hash());
    }

    #[test]
    fn empty_legacy_object_parses_to_empty_feature_map() {
        let doc = RuleDocument::parse(b"{}").unwrap();
        assert!(doc.features.is_empty());
    }

    #[test]
    fn non_object_body_is_unrecognized_shape() {
        let err = RuleDocument::parse(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, RuleDocError::UnrecognizedShape));
    }

    #[test]
    fn invalid_json_is_a_json_error() {
        let err = RuleDocument::parse(b"not json").unwrap_err();
        assert!(matches!(err, RuleDocError::Json(_)));
    }

    #[test]
    fn identical_documents_hash_identically_rule_identity_property_3() {
        let a = RuleDocument::parse(br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#).unwrap();
        let b = RuleDocument::parse(br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn feature_to_rules_index_preserves_order() {
        let doc = RuleDocument::parse(
            br#"{"features":{"f":[{"value":"a","conditions":{}},{"value":"b","conditions":{}}]}}"#,
        )
        .unwrap();
        let indexes = RuleIndexes::build(&doc);
        let rules = indexes.rules_for_feature("f");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].value, "a");
        assert_eq!(rules[1].value, "b");
    }

    #[test]
    fn event_name_index_covers_all_referencing_features() {
        let json = br#"{"features":{
            "f1":[{"value":"v","conditions":{"events":[{"key":"login"}]}}],
            "f2":[{"value":"v","conditions":{"events":[{"key":"login"}]}}]
        }}"#;
        let doc = RuleDocument::parse(json).unwrap();
        let indexes = RuleIndexes::build(&doc);
        let features = indexes.event_name_to_features.get("login").unwrap();
        assert!(features.contains("f1"));
        assert!(features.contains("f2"));
    }

    #[test]
    fn staleness_detected_after_document_changes() {
        let doc = RuleDocument::parse(br#"{"features":{"f":[{"value":"a","conditions":{}}]}}"#).unwrap();
        let indexes = RuleIndexes::build(&doc);
        let changed = RuleDocument::parse(br#"{"features":{"f":[{"value":"b","conditions":{}}]}}"#).unwrap();
        assert!(indexes.is_stale_against(&changed));
        assert!(!indexes.is_stale_against(&doc));
    }
}
