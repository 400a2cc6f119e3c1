//! C2 — Event Store: an append-only, time-ordered log with size/age
//! retention (spec §3, §4.2).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// An immutable event record (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub name: String,
    /// Monotonic wall-clock milliseconds, as supplied by the host clock.
    pub timestamp: i64,
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

impl EventRecord {
    pub fn new(name: impl Into<String>, timestamp: i64, parameters: HashMap<String, Value>) -> Self {
        Self {
            name: name.into(),
            timestamp,
            parameters,
        }
    }
}

/// Retention parameters, clamped per spec §3.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_events: u32,
    pub max_age_days: u32,
}

/// Retention bounds from spec §3. Kept as plain constants here (rather
/// than depending on `featureflow-config`) so the engine crate has no
/// dependency on the host-config crate; `featureflow-config` carries the
/// same values for its own clamping of `EngineConfig`.
pub const MIN_MAX_EVENTS: u32 = 100;
pub const MAX_MAX_EVENTS: u32 = 100_000;
pub const DEFAULT_MAX_EVENTS: u32 = 5_000;
pub const MIN_MAX_EVENT_AGE_DAYS: u32 = 1;
pub const MAX_MAX_EVENT_AGE_DAYS: u32 = 365;
pub const DEFAULT_MAX_EVENT_AGE_DAYS: u32 = 7;

impl RetentionPolicy {
    pub fn new(max_events: u32, max_age_days: u32) -> Self {
        Self {
            max_events: max_events.clamp(MIN_MAX_EVENTS, MAX_MAX_EVENTS),
            max_age_days: max_age_days.clamp(MIN_MAX_EVENT_AGE_DAYS, MAX_MAX_EVENT_AGE_DAYS),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_MAX_EVENT_AGE_DAYS)
    }
}

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Hysteresis target: once an over-trim is triggered, drop down to this
/// fraction of `max_events` rather than exactly `max_events`, so a
/// steady append rate doesn't re-trigger a trim on every single append
/// (spec §4.2 "over-trim hysteresis").
const TRIM_TARGET_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Default)]
pub struct EventStore {
    events: VecDeque<EventRecord>,
    policy: RetentionPolicy,
}

impl EventStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            events: VecDeque::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: RetentionPolicy) {
        self.policy = policy;
        self.enforce_retention(now_millis());
    }

    /// Append a record, preserving insertion order, then enforce
    /// retention (spec §4.2): drop everything older than the age
    /// cutoff, then, if still over `max_events`, drop the oldest until
    /// 80% of `max_events` remain.
    pub fn append(&mut self, record: EventRecord) {
        self.events.push_back(record);
        self.enforce_retention(now_millis());
    }

    fn enforce_retention(&mut self, now_millis: i64) {
        let cutoff = now_millis - self.policy.max_age_days as i64 * MILLIS_PER_DAY;
        while let Some(front) = self.events.front() {
            if front.timestamp < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }

        if self.events.len() > self.policy.max_events as usize {
            let target = ((self.policy.max_events as f64) * TRIM_TARGET_FRACTION) as usize;
            while self.events.len() > target.max(1) {
                self.events.pop_front();
            }
            tracing::debug!(
                remaining = self.events.len(),
                max_events = self.policy.max_events,
                "event store over-trimmed to hysteresis target"
            );
        }
    }

    /// A stable snapshot of the log in insertion order, for evaluation.
    /// Readers never observe a torn state because `EventStore` is only
    /// ever mutated from the mutation executor (spec §5).
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Replace the whole log (used when restoring a persisted
    /// snapshot at startup), re-applying retention afterward in case
    /// the persisted policy differs from the current one.
    pub fn restore(&mut self, events: Vec<EventRecord>) {
        self.events = events.into_iter().collect();
        self.enforce_retention(now_millis());
    }
}

/// Host-supplied monotonic-wall-clock source (spec §9 "Numeric
/// safety": "Time arithmetic must use a stable monotonic or
/// wall-clock source chosen by the host"). Exposed so callers in other
/// modules share one clock function.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(name: &str, ts: i64) -> EventRecord {
        EventRecord::new(name, ts, HashMap::new())
    }

    #[test]
    fn append_preserves_insertion_order() {
        let mut store = EventStore::new(RetentionPolicy::new(100, 7));
        let now = now_millis();
        store.append(rec("a", now));
        store.append(rec("b", now));
        store.append(rec("c", now));
        let names: Vec<_> = store.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn retention_drops_events_older_than_max_age() {
        let mut store = EventStore::new(RetentionPolicy::new(100, 1));
        let now = now_millis();
        store.append(rec("old", now - 25 * 60 * 60 * 1000));
        store.append(rec("new", now - 1_000));
        let names: Vec<_> = store.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["new"]);
    }

    #[test]
    fn retention_trims_to_hysteresis_target_when_over_count() {
        let mut store = EventStore::new(RetentionPolicy::new(100, 365));
        let now = now_millis();
        for i in 0..101 {
            store.append(rec("e", now + i));
        }
        // Over-trim target is 80% of 100 = 80.
        assert_eq!(store.len(), 80);
    }

    #[test]
    fn clamp_enforces_spec_bounds() {
        let policy = RetentionPolicy::new(1, 10_000);
        assert_eq!(policy.max_events, 100);
        assert_eq!(policy.max_age_days, 365);
    }
}
