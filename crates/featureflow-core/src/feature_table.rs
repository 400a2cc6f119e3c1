//! C6 — Feature Table and Listeners: cached `feature -> value?` map,
//! recomputed by walking the feature→rules index, with change
//! notifications (spec §4.5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::condition;
use crate::event_store::EventRecord;
use crate::properties::PropertyBag;
use crate::rules::RuleSet;

pub type ListenerToken = u64;

/// A single `(feature, new-value)` change notification. Listener
/// invocation happens off the mutation executor's lock (spec §4.5,
/// §5) — `FeatureTable` only computes diffs; the caller (C9) notifies
/// after releasing its lock.
pub type FeatureChange = (String, Option<String>);

/// `Arc`-wrapped so the engine can clone matching listeners out from
/// under the mutation lock and invoke them on a dedicated notification
/// task (spec §5 "a slow listener never blocks the mutation executor").
pub type Listener = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

#[derive(Default)]
pub struct FeatureTable {
    values: HashMap<String, String>,
    /// Listeners are scoped to the single feature they were registered
    /// against (spec §6 `add_listener(feature, callback)`), but removal
    /// also supports a global opaque token (spec §4.5).
    listeners: HashMap<ListenerToken, (String, Listener)>,
    next_token: ListenerToken,
}

impl FeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feature: &str) -> Option<&str> {
        self.values.get(feature).map(String::as_str)
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.clone()
    }

    pub fn add_listener(&mut self, feature: impl Into<String>, listener: Listener) -> ListenerToken {
        self.next_token += 1;
        let token = self.next_token;
        self.listeners.insert(token, (feature.into(), listener));
        token
    }

    pub fn remove_listener(&mut self, token: ListenerToken) {
        self.listeners.remove(&token);
    }

    /// Remove every listener registered against `feature` (spec §6
    /// `remove_all_listeners(feature)`).
    pub fn remove_all_listeners(&mut self, feature: &str) {
        self.listeners.retain(|_, (f, _)| f != feature);
    }

    pub fn clear_all_listeners(&mut self) {
        self.listeners.clear();
    }

    /// Invoke every listener registered against a changed feature.
    /// Callers must not hold the mutation lock while calling this.
    pub fn notify(&self, changes: &[FeatureChange]) {
        for (feature, value) in changes {
            for (listener_feature, listener) in self.listeners.values() {
                if listener_feature == feature {
                    listener(feature, value.as_deref());
                }
            }
        }
    }

    /// Clone out the listeners matching a changed feature without
    /// invoking them, so the caller can dispatch off the mutation lock
    /// (spec §5).
    pub fn listeners_for(&self, feature: &str) -> Vec<Listener> {
        self.listeners
            .values()
            .filter(|(f, _)| f == feature)
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    /// Full re-evaluation pass (spec §4.5): for each feature in the
    /// active rule set, scan its rules in order and take the first
    /// whose conditions hold; absent if none match. Features no
    /// longer present in the rule set are dropped. Returns the set of
    /// changed features (including absence transitions).
    pub fn evaluate(
        &mut self,
        rule_set: &RuleSet,
        events: &[EventRecord],
        user_props: &PropertyBag,
        device_props: &PropertyBag,
        now_millis: i64,
    ) -> Vec<FeatureChange> {
        let mut new_values: HashMap<String, String> = HashMap::new();
        for feature in rule_set.indexes.feature_names() {
            for rule in rule_set.indexes.rules_for_feature(feature) {
                if condition::evaluate(&rule.conditions, events, user_props, device_props, now_millis) {
                    new_values.insert(feature.clone(), rule.value.clone());
                    break;
                }
            }
        }

        let changed = diff(&self.values, &new_values);
        self.values = new_values;
        changed
    }

    /// Clear one feature's cached value and re-evaluate; returns the
    /// diff from the cleared baseline (spec §4.5 — this always reports
    /// the feature as absent first, even if it is immediately
    /// re-matched by the same rule, so the host can rely on
    /// `reset_feature` to re-arm a fire-once trigger).
    pub fn reset_feature(
        &mut self,
        name: &str,
        rule_set: &RuleSet,
        events: &[EventRecord],
        user_props: &PropertyBag,
        device_props: &PropertyBag,
        now_millis: i64,
    ) -> Vec<FeatureChange> {
        self.values.remove(name);
        self.evaluate(rule_set, events, user_props, device_props, now_millis)
    }

    pub fn reset_all_features(
        &mut self,
        rule_set: &RuleSet,
        events: &[EventRecord],
        user_props: &PropertyBag,
        device_props: &PropertyBag,
        now_millis: i64,
    ) -> Vec<FeatureChange> {
        self.values.clear();
        self.evaluate(rule_set, events, user_props, device_props, now_millis)
    }
}

fn diff(old: &HashMap<String, String>, new: &HashMap<String, String>) -> Vec<FeatureChange> {
    let all_features: HashSet<&String> = old.keys().chain(new.keys()).collect();
    let mut changed = Vec::new();
    for feature in all_features {
        let old_value = old.get(feature);
        let new_value = new.get(feature);
        if old_value != new_value {
            changed.push((feature.clone(), new_value.cloned()));
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleDocument;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn rule_set(json: &[u8]) -> RuleSet {
        RuleSet::from_document(RuleDocument::parse(json).unwrap())
    }

    #[test]
    fn first_match_wins_property_4() {
        let rs = rule_set(
            br#"{"features":{"f":[
                {"value":"first","conditions":{}},
                {"value":"second","conditions":{}}
            ]}}"#,
        );
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        table.evaluate(&rs, &[], &bag, &bag, 0);
        assert_eq!(table.get("f"), Some("first"));
    }

    #[test]
    fn no_match_is_absent_property_5() {
        let rs = rule_set(
            br#"{"features":{"f":[
                {"value":"v","conditions":{"user_properties":[{"key":"role","value":{"operator":"==","value":"admin"}}]}}
            ]}}"#,
        );
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        table.evaluate(&rs, &[], &bag, &bag, 0);
        assert_eq!(table.get("f"), None);
    }

    #[test]
    fn listener_fires_on_change_property_6() {
        let rs = rule_set(br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#);
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        table.add_listener("f", Arc::new(move |_feature, _value| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let changes = table.evaluate(&rs, &[], &bag, &bag, 0);
        table.notify(&changes);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Re-evaluating with no change fires no further notifications.
        let changes = table.evaluate(&rs, &[], &bag, &bag, 0);
        table.notify(&changes);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_feature_drops_from_table() {
        let rs = rule_set(br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#);
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        table.evaluate(&rs, &[], &bag, &bag, 0);
        assert_eq!(table.get("f"), Some("v"));

        let empty_rs = rule_set(br#"{"features":{}}"#);
        let changes = table.evaluate(&empty_rs, &[], &bag, &bag, 0);
        assert_eq!(changes, vec![("f".to_string(), None)]);
        assert_eq!(table.get("f"), None);
    }

    #[test]
    fn reset_feature_reports_change_even_if_rematched() {
        let rs = rule_set(br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#);
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        table.evaluate(&rs, &[], &bag, &bag, 0);
        assert_eq!(table.get("f"), Some("v"));

        let changes = table.reset_feature("f", &rs, &[], &bag, &bag, 0);
        // Same value re-matches, but the diff is against the cleared
        // baseline, so it is reported as a change.
        assert_eq!(changes, vec![("f".to_string(), Some("v".to_string()))]);
    }

    #[test]
    fn reset_all_features_clears_and_reports_every_change() {
        let rs = rule_set(
            br#"{"features":{
                "f1":[{"value":"a","conditions":{}}],
                "f2":[{"value":"b","conditions":{}}]
            }}"#,
        );
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        table.evaluate(&rs, &[], &bag, &bag, 0);
        let mut changes = table.reset_all_features(&rs, &[], &bag, &bag, 0);
        changes.sort();
        assert_eq!(
            changes,
            vec![
                ("f1".to_string(), Some("a".to_string())),
                ("f2".to_string(), Some("b".to_string())),
            ]
        );
    }

    #[test]
    fn remove_listener_stops_future_notifications() {
        let rs = rule_set(br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#);
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let token = table.add_listener("f", Arc::new(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        table.remove_listener(token);
        let changes = table.evaluate(&rs, &[], &bag, &bag, 0);
        table.notify(&changes);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_all_listeners_for_feature_leaves_other_features_intact() {
        let rs = rule_set(
            br#"{"features":{"f1":[{"value":"a","conditions":{}}],"f2":[{"value":"b","conditions":{}}]}}"#,
        );
        let mut table = FeatureTable::new();
        let bag = PropertyBag::default();
        let f1_count = Arc::new(AtomicUsize::new(0));
        let f2_count = Arc::new(AtomicUsize::new(0));
        let (f1_clone, f2_clone) = (f1_count.clone(), f2_count.clone());
        table.add_listener("f1", Arc::new(move |_, _| { f1_clone.fetch_add(1, Ordering::SeqCst); }));
        table.add_listener("f2", Arc::new(move |_, _| { f2_clone.fetch_add(1, Ordering::SeqCst); }));
        table.remove_all_listeners("f1");
        let changes = table.evaluate(&rs, &[], &bag, &bag, 0);
        table.notify(&changes);
        assert_eq!(f1_count.load(Ordering::SeqCst), 0);
        assert_eq!(f2_count.load(Ordering::SeqCst), 1);
    }
}
