//! C4 — Condition Evaluator: event/sequence/property predicates over
//! the event store and property bags (spec §4.3).

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::comparator::{self, Operator};
use crate::event_store::EventRecord;
use crate::properties::PropertyBag;
use crate::value::Value;

const MILLIS_PER_DAY: i64 = 86_400_000;
const MAX_WITHIN_LAST_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventsMode {
    #[default]
    Simple,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOp {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SequenceOrdering {
    #[default]
    Direct,
    Indirect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountSpec {
    pub operator: Operator,
    pub value: f64,
}

impl CountSpec {
    fn satisfied_by(&self, actual: usize) -> bool {
        let actual = actual as f64;
        match self.operator {
            Operator::Eq => actual == self.value,
            Operator::Ne => actual != self.value,
            Operator::Lt => actual < self.value,
            Operator::Le => actual <= self.value,
            Operator::Gt => actual > self.value,
            Operator::Ge => actual >= self.value,
            other => {
                tracing::warn!(operator = ?other, "count condition with non-ordering operator — treated as unsatisfied");
                false
            }
        }
    }

    /// Maximum events a sequence step may greedily consume.
    fn cap(&self) -> usize {
        match self.operator {
            Operator::Eq | Operator::Le => self.value.max(0.0) as usize,
            Operator::Lt => (self.value.max(0.0) as usize).saturating_sub(1),
            _ => usize::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamPredicate {
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCondition {
    pub key: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub count: Option<CountSpec>,
    #[serde(default)]
    pub within_last_days: Option<u32>,
    #[serde(default)]
    pub param: Option<HashMap<String, ParamPredicate>>,
    #[serde(default)]
    pub not: bool,
}

impl EventCondition {
    fn clamped_within_last_days(&self) -> Option<u32> {
        self.within_last_days.map(|d| d.clamp(0, MAX_WITHIN_LAST_DAYS))
    }

    /// Whether a single event record matches this condition's name,
    /// parameter, and time-window checks (not its `count`/`not`, which
    /// apply to the aggregate match set, not a single event).
    fn event_matches(&self, event: &EventRecord, now_millis: i64) -> bool {
        if !comparator::compare(
            &Value::from(event.name.as_str()),
            self.operator,
            &Value::from(self.key.as_str()),
        ) {
            return false;
        }

        if let Some(days) = self.clamped_within_last_days() {
            let age = now_millis - event.timestamp;
            if age > days as i64 * MILLIS_PER_DAY {
                return false;
            }
        }

        if let Some(params) = &self.param {
            for (param_key, predicate) in params {
                match event.parameters.get(param_key) {
                    Some(actual) => {
                        if !comparator::compare(actual, predicate.operator, &predicate.value) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }

        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventsConfig {
    pub mode: EventsMode,
    pub operator: BoolOp,
    pub ordering: SequenceOrdering,
    pub events: Vec<EventCondition>,
}

impl Serialize for EventsConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Full<'a> {
            mode: EventsMode,
            operator: BoolOp,
            ordering: SequenceOrdering,
            events: &'a [EventCondition],
        }
        Full {
            mode: self.mode,
            operator: self.operator,
            ordering: self.ordering,
            events: &self.events,
        }
        .serialize(serializer)
    }
}

/// `events` accepts either a bare array (legacy — treated as
/// simple/AND) or the full `{ mode, operator, ordering, events }`
/// object (spec §6 "Conditions JSON schema").
impl<'de> Deserialize<'de> for EventsConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EventsConfigVisitor;

        impl<'de> Visitor<'de> for EventsConfigVisitor {
            type Value = EventsConfig;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array of event conditions, or an events-config object")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut events = Vec::new();
                while let Some(cond) = seq.next_element::<EventCondition>()? {
                    events.push(cond);
                }
                Ok(EventsConfig {
                    mode: EventsMode::Simple,
                    operator: BoolOp::And,
                    ordering: SequenceOrdering::Direct,
                    events,
                })
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                #[derive(Deserialize)]
                #[serde(rename_all = "snake_case")]
                struct Body {
                    #[serde(default)]
                    mode: EventsMode,
                    #[serde(default)]
                    operator: BoolOp,
                    #[serde(default)]
                    ordering: SequenceOrdering,
                    #[serde(default)]
                    events: Vec<EventCondition>,
                }
                let body = Body::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(EventsConfig {
                    mode: body.mode,
                    operator: body.operator,
                    ordering: body.ordering,
                    events: body.events,
                })
            }
        }

        deserializer.deserialize_any(EventsConfigVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropPredicate {
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyCondition {
    pub key: String,
    pub value: PropPredicate,
    #[serde(default)]
    pub not: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionsSpec {
    pub events: EventsConfig,
    pub user_properties: Vec<PropertyCondition>,
    pub user_properties_operator: BoolOp,
    pub device: Vec<PropertyCondition>,
    pub device_operator: BoolOp,
}

/// Top-level evaluation: AND of the three independent predicates
/// (spec §4.3). An empty conditions spec is vacuously true.
pub fn evaluate(
    spec: &ConditionsSpec,
    events: &[EventRecord],
    user_props: &PropertyBag,
    device_props: &PropertyBag,
    now_millis: i64,
) -> bool {
    evaluate_events_config(&spec.events, events, now_millis)
        && evaluate_property_list(&spec.user_properties, spec.user_properties_operator, user_props)
        && evaluate_property_list(&spec.device, spec.device_operator, device_props)
}

fn evaluate_property_list(conditions: &[PropertyCondition], op: BoolOp, bag: &PropertyBag) -> bool {
    if conditions.is_empty() {
        return true;
    }
    let mut results = conditions.iter().map(|cond| evaluate_property_condition(cond, bag));
    match op {
        BoolOp::And => results.all(|r| r),
        BoolOp::Or => results.any(|r| r),
    }
}

fn evaluate_property_condition(cond: &PropertyCondition, bag: &PropertyBag) -> bool {
    let raw = match bag.get(&cond.key) {
        Some(v) => v,
        None => return cond.not, // absent => false, inverted by `not`
    };
    let result = comparator::compare(
        &Value::from(raw),
        cond.value.operator,
        &cond.value.value,
    );
    if cond.not { !result } else { result }
}

fn evaluate_events_config(config: &EventsConfig, events: &[EventRecord], now_millis: i64) -> bool {
    if config.events.is_empty() {
        return true;
    }
    match config.mode {
        EventsMode::Simple => evaluate_simple(config, events, now_millis),
        EventsMode::Sequence => match config.ordering {
            SequenceOrdering::Direct => evaluate_direct_sequence(&config.events, events, now_millis),
            SequenceOrdering::Indirect => evaluate_indirect_sequence(&config.events, events, now_millis),
        },
    }
}

fn evaluate_simple(config: &EventsConfig, events: &[EventRecord], now_millis: i64) -> bool {
    let mut results = config
        .events
        .iter()
        .map(|cond| evaluate_simple_condition(cond, events, now_millis));
    match config.operator {
        BoolOp::And => results.all(|r| r),
        BoolOp::Or => results.any(|r| r),
    }
}

/// §4.3.1: for a single simple-mode event condition, the match set `M`
/// is every event whose name matches `key` under `operator`, further
/// restricted to `within_last_days`. §4.3.1 items 1-3 apply in
/// priority order: `count` if present, else `param`, else non-empty.
fn evaluate_simple_condition(cond: &EventCondition, events: &[EventRecord], now_millis: i64) -> bool {
    let matching: Vec<&EventRecord> = events
        .iter()
        .filter(|e| name_and_window_match(cond, e, now_millis))
        .collect();

    let result = if let Some(count) = &cond.count {
        count.satisfied_by(matching.len())
    } else if let Some(params) = &cond.param {
        matching.iter().any(|e| params_match(params, e))
    } else {
        !matching.is_empty()
    };

    if cond.not { !result } else { result }
}

fn name_and_window_match(cond: &EventCondition, event: &EventRecord, now_millis: i64) -> bool {
    if !comparator::compare(
        &Value::from(event.name.as_str()),
        cond.operator,
        &Value::from(cond.key.as_str()),
    ) {
        return false;
    }
    if let Some(days) = cond.clamped_within_last_days() {
        let age = now_millis - event.timestamp;
        if age > days as i64 * MILLIS_PER_DAY {
            return false;
        }
    }
    true
}

fn params_match(params: &HashMap<String, ParamPredicate>, event: &EventRecord) -> bool {
    params.iter().all(|(key, predicate)| {
        event
            .parameters
            .get(key)
            .is_some_and(|actual| comparator::compare(actual, predicate.operator, &predicate.value))
    })
}

/// §4.3.2 direct sequence: a contiguous run assigning consecutive
/// events to consecutive steps, anchored at the first event matching
/// step 0. A single forward pass from that anchor — a later occurrence
/// of step 0 does not get to re-anchor a fresh run (testable property
/// 8: direct `[A, D]` over `[A, B, C, A, D]` must stay false, not match
/// the contiguous `A@3, D@4` pair).
fn evaluate_direct_sequence(steps: &[EventCondition], events: &[EventRecord], now_millis: i64) -> bool {
    let Some(first_step) = steps.first() else {
        return true;
    };
    let start = match events.iter().position(|e| first_step.event_matches(e, now_millis)) {
        Some(idx) => idx,
        None => return false,
    };
    direct_sequence_matches_from(steps, events, start, now_millis)
}

fn direct_sequence_matches_from(
    steps: &[EventCondition],
    events: &[EventRecord],
    start: usize,
    now_millis: i64,
) -> bool {
    let mut pos = start;
    for step in steps {
        let cap = step.count.as_ref().map(CountSpec::cap).unwrap_or(usize::MAX);
        let mut consumed = 0usize;
        while pos < events.len() && consumed < cap && step.event_matches(&events[pos], now_millis) {
            consumed += 1;
            pos += 1;
        }
        let satisfied = match &step.count {
            Some(count) => count.satisfied_by(consumed),
            None => consumed > 0,
        };
        let satisfied = if step.not { !satisfied } else { satisfied };
        if !satisfied {
            return false;
        }
    }
    true
}

/// §4.3.2 indirect sequence: steps match in order, but events between
/// successive step matches are allowed (forward-scan-from-previous-match
/// semantics — see DESIGN.md Open Question decisions).
fn evaluate_indirect_sequence(steps: &[EventCondition], events: &[EventRecord], now_millis: i64) -> bool {
    let mut pos = 0usize;
    for step in steps {
        match &step.count {
            None => {
                let found = events[pos..]
                    .iter()
                    .position(|e| step.event_matches(e, now_millis));
                match found {
                    Some(offset) => pos += offset + 1,
                    None => return step.not,
                }
            }
            Some(count) => {
                let suffix = &events[pos..];
                let matched = suffix.iter().filter(|e| step.event_matches(e, now_millis)).count();
                let satisfied = count.satisfied_by(matched);
                let satisfied = if step.not { !satisfied } else { satisfied };
                if !satisfied {
                    return false;
                }
                // Advance past the last matching event in the suffix so
                // later steps only see events after this step's matches.
                if let Some(last_offset) = suffix
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| step.event_matches(e, now_millis))
                    .map(|(i, _)| i)
                    .next_back()
                {
                    pos += last_offset + 1;
                }
            }
        }
    }
    true
}
