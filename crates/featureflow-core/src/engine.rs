//! C9 — Concurrency Controller and Host API: a single
//! `tokio::sync::Mutex`-guarded `EngineState`, background `tokio::select!`
//! loops for auto-refresh and debounced persistence, and a dedicated
//! notification task so a slow listener never blocks the mutation
//! executor — modeled directly on the teacher's unified daemon loop
//! (`run_unified_daemon`: one state lock, `tokio::spawn`ed background
//! tasks, a `watch` shutdown signal).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Mutex};

use crate::event_store::{now_millis, EventRecord, EventStore, RetentionPolicy};
use crate::feature_table::{FeatureChange, FeatureTable, Listener, ListenerToken};
use crate::lifecycle::{RefreshOutcome, RuleLifecycle};
use crate::persistence::{self, PersistenceBackend};
use crate::properties::Properties;
use crate::rules::RuleSet;
use crate::value::Value;
use featureflow_transport::{PointerRequest, RulesTransport};

/// Debounced persistence writer (spec §4.7, §5): flush after this many
/// quiet seconds, or after this many pending appends, whichever comes
/// first.
const PERSIST_DEBOUNCE_QUIET: std::time::Duration = std::time::Duration::from_secs(5);
const PERSIST_DEBOUNCE_MAX_APPENDS: u32 = 10;

struct EngineState {
    events: EventStore,
    properties: Properties,
    rule_set: RuleSet,
    feature_table: FeatureTable,
}

struct NotificationJob {
    feature: String,
    value: Option<String>,
    listeners: Vec<Listener>,
}

/// The Host API surface (spec §6). One `Engine` per `(company, tenant,
/// environment)` namespace; cheap to `Clone` (everything inside is
/// `Arc`-shared) so CLI subcommands and background tasks can hold
/// independent handles to the same running engine.
#[derive(Clone)]
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    lifecycle: Arc<RuleLifecycle>,
    persistence: Arc<dyn PersistenceBackend>,
    namespace: String,
    notify_tx: mpsc::UnboundedSender<NotificationJob>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    pending_appends: Arc<AtomicU32>,
    persist_dirty_tx: mpsc::UnboundedSender<()>,
}

impl Engine {
    /// Equivalent to `initialize(...)` (spec §6): loads any persisted
    /// rule document, event log, and properties for this namespace,
    /// then spins up the background auto-refresh and debounced
    /// persistence tasks.
    pub async fn initialize(
        namespace: String,
        persistence: Arc<dyn PersistenceBackend>,
        transport: Option<Arc<dyn RulesTransport>>,
        pointer_request: Option<PointerRequest>,
        retention: RetentionPolicy,
        poll_interval_ms: u64,
        auto_refresh: bool,
    ) -> Result<Self> {
        let lifecycle = Arc::new(RuleLifecycle::new(
            persistence.clone(),
            namespace.clone(),
            transport,
            pointer_request,
            poll_interval_ms,
        ));

        let rule_set = lifecycle.initial_load()?.unwrap_or_else(RuleSet::empty);
        let events = load_events(&persistence, &namespace, retention)?;
        let properties = load_properties(&persistence, &namespace)?;

        let mut feature_table = FeatureTable::new();
        feature_table.evaluate(&rule_set, &events.snapshot(), &properties.user, &properties.device, now_millis());

        let state = Arc::new(Mutex::new(EngineState { events, properties, rule_set, feature_table }));

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        spawn_notification_task(notify_rx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (persist_dirty_tx, persist_dirty_rx) = mpsc::unbounded_channel();

        let engine = Self {
            state,
            lifecycle,
            persistence,
            namespace,
            notify_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            pending_appends: Arc::new(AtomicU32::new(0)),
            persist_dirty_tx,
        };

        if auto_refresh {
            engine.spawn_auto_refresh_task(shutdown_rx.clone());
        }
        engine.spawn_persistence_task(persist_dirty_rx, shutdown_rx);

        Ok(engine)
    }

    /// Local mode (spec §4.6, §6 `initialize_local(rules_json)`): bypass
    /// the network entirely and install a host-supplied rule document.
    /// No auto-refresh task is started.
    pub async fn initialize_local(
        namespace: String,
        persistence: Arc<dyn PersistenceBackend>,
        retention: RetentionPolicy,
        rules_json: &str,
    ) -> Result<Self> {
        let lifecycle = Arc::new(RuleLifecycle::new(persistence.clone(), namespace.clone(), None, None, 300_000));
        let rule_set = lifecycle.install_local(rules_json)?;
        let events = load_events(&persistence, &namespace, retention)?;
        let properties = load_properties(&persistence, &namespace)?;

        let mut feature_table = FeatureTable::new();
        feature_table.evaluate(&rule_set, &events.snapshot(), &properties.user, &properties.device, now_millis());

        let state = Arc::new(Mutex::new(EngineState { events, properties, rule_set, feature_table }));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        spawn_notification_task(notify_rx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (persist_dirty_tx, persist_dirty_rx) = mpsc::unbounded_channel();

        let engine = Self {
            state,
            lifecycle,
            persistence,
            namespace,
            notify_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            pending_appends: Arc::new(AtomicU32::new(0)),
            persist_dirty_tx,
        };
        engine.spawn_persistence_task(persist_dirty_rx, shutdown_rx);
        Ok(engine)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_auto_refresh_task(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let sleep = tokio::time::sleep(engine.lifecycle.jittered_poll_interval());
                tokio::select! {
                    _ = sleep => {
                        if let Err(err) = engine.refresh_rules().await {
                            tracing::warn!(error = %err, "auto-refresh failed, keeping current rule set");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_persistence_task(
        &self,
        mut dirty_rx: mpsc::UnboundedReceiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = dirty_rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                        // Drain a backlog of dirty signals, then wait
                        // out the quiet period before flushing, unless
                        // the append-count threshold forces an early
                        // flush (spec §4.7 "debounced writer").
                        loop {
                            if engine.pending_appends.load(Ordering::SeqCst) >= PERSIST_DEBOUNCE_MAX_APPENDS {
                                break;
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(PERSIST_DEBOUNCE_QUIET) => break,
                                more = dirty_rx.recv() => {
                                    if more.is_none() {
                                        return;
                                    }
                                }
                            }
                        }
                        if let Err(err) = engine.flush_events().await {
                            tracing::warn!(error = %err, "debounced event persistence failed");
                        }
                        engine.pending_appends.store(0, Ordering::SeqCst);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            let _ = engine.flush_events().await;
                            break;
                        }
                    }
                }
            }
        });
    }

    fn namespaced_key(&self, suffix: &str) -> String {
        format!("{}/{}", self.namespace, suffix)
    }

    async fn flush_events(&self) -> Result<()> {
        let snapshot = {
            let state = self.state.lock().await;
            state.events.snapshot()
        };
        let bytes = serde_json::to_vec(&snapshot).context("serializing event log")?;
        self.persistence.put(&self.namespaced_key(persistence::keys::EVENTS), &bytes)
    }

    async fn persist_properties(&self) -> Result<()> {
        let properties = {
            let state = self.state.lock().await;
            state.properties.clone()
        };
        let bytes = serde_json::to_vec(&properties).context("serializing properties")?;
        self.persistence.put(&self.namespaced_key(persistence::keys::PROPERTIES), &bytes)
    }

    fn mark_dirty(&self) {
        self.pending_appends.fetch_add(1, Ordering::SeqCst);
        let _ = self.persist_dirty_tx.send(());
    }

    fn dispatch_changes(&self, changes: Vec<FeatureChange>, feature_table: &FeatureTable) {
        for (feature, value) in changes {
            let listeners = feature_table.listeners_for(&feature);
            if listeners.is_empty() {
                continue;
            }
            let _ = self.notify_tx.send(NotificationJob { feature, value, listeners });
        }
    }

    /// `log_event(name, parameters?)` (spec §6).
    pub async fn log_event(&self, name: impl Into<String>, parameters: HashMap<String, Value>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let now = now_millis();
            state.events.append(EventRecord::new(name, now, parameters));
            let events = state.events.snapshot();
            let changes = state.feature_table.evaluate(&state.rule_set, &events, &state.properties.user, &state.properties.device, now);
            self.dispatch_changes(changes, &state.feature_table);
        }
        self.mark_dirty();
        Ok(())
    }

    pub async fn set_user_property(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.mutate_properties(true, |props| props.user.set(key, value)).await
    }

    pub async fn remove_user_property(&self, key: &str) -> Result<()> {
        self.mutate_properties(true, |props| props.user.remove(key)).await
    }

    pub async fn set_device_property(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.mutate_properties(true, |props| props.device.set(key, value)).await
    }

    pub async fn remove_device_property(&self, key: &str) -> Result<()> {
        self.mutate_properties(true, |props| props.device.remove(key)).await
    }

    async fn mutate_properties(&self, persist: bool, mutate: impl FnOnce(&mut Properties)) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            mutate(&mut state.properties);
            let now = now_millis();
            let events = state.events.snapshot();
            let changes = state.feature_table.evaluate(&state.rule_set, &events, &state.properties.user, &state.properties.device, now);
            self.dispatch_changes(changes, &state.feature_table);
        }
        if persist {
            self.persist_properties().await?;
        }
        Ok(())
    }

    pub async fn get_feature_value(&self, name: &str) -> Option<String> {
        self.maybe_opportunistic_refresh().await;
        let state = self.state.lock().await;
        state.feature_table.get(name).map(str::to_string)
    }

    /// `is_feature_enabled(name) -> bool` (spec §6): true iff the
    /// value's lowercase form is one of `{true, on, enabled, 1}`.
    pub async fn is_feature_enabled(&self, name: &str) -> bool {
        match self.get_feature_value(name).await {
            Some(value) => matches!(value.to_lowercase().as_str(), "true" | "on" | "enabled" | "1"),
            None => false,
        }
    }

    async fn maybe_opportunistic_refresh(&self) {
        if self.lifecycle.should_opportunistic_fetch(now_millis()) {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.refresh_rules().await {
                    tracing::debug!(error = %err, "opportunistic background refresh failed");
                }
            });
        }
    }

    pub async fn reset_feature(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        let events = state.events.snapshot();
        let changes = state
            .feature_table
            .reset_feature(name, &state.rule_set, &events, &state.properties.user, &state.properties.device, now);
        self.dispatch_changes(changes, &state.feature_table);
        Ok(())
    }

    pub async fn reset_all_features(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        let events = state.events.snapshot();
        let changes = state
            .feature_table
            .reset_all_features(&state.rule_set, &events, &state.properties.user, &state.properties.device, now);
        self.dispatch_changes(changes, &state.feature_table);
        Ok(())
    }

    pub async fn add_listener(&self, feature: impl Into<String>, listener: Listener) -> ListenerToken {
        let mut state = self.state.lock().await;
        state.feature_table.add_listener(feature, listener)
    }

    pub async fn remove_listener(&self, token: ListenerToken) {
        let mut state = self.state.lock().await;
        state.feature_table.remove_listener(token);
    }

    pub async fn remove_all_listeners(&self, feature: &str) {
        let mut state = self.state.lock().await;
        state.feature_table.remove_all_listeners(feature);
    }

    pub async fn clear_all_listeners(&self) {
        let mut state = self.state.lock().await;
        state.feature_table.clear_all_listeners();
    }

    /// `refresh_rules()` (spec §6): fetch, compare, and — on a new
    /// document — install and re-evaluate every feature. Concurrent
    /// callers collapse to one outbound request (`RuleLifecycle`
    /// handles this).
    pub async fn refresh_rules(&self) -> Result<()> {
        let current_hash = {
            let state = self.state.lock().await;
            state.rule_set.content_hash.clone()
        };

        match self.lifecycle.refresh_rules(&current_hash).await? {
            RefreshOutcome::NoTransport => Ok(()),
            RefreshOutcome::CacheHit { country_header } => self.apply_country_header(country_header).await,
            RefreshOutcome::RulesUpdated { rule_set, country_header } => {
                {
                    let mut state = self.state.lock().await;
                    state.rule_set = rule_set;
                    if let Some(country) = country_header.as_deref() {
                        state.properties.apply_country_header(Some(country));
                    }
                    let now = now_millis();
                    let events = state.events.snapshot();
                    let changes = state.feature_table.evaluate(&state.rule_set, &events, &state.properties.user, &state.properties.device, now);
                    self.dispatch_changes(changes, &state.feature_table);
                }
                self.persist_properties().await?;
                Ok(())
            }
        }
    }

    async fn apply_country_header(&self, country_header: Option<String>) -> Result<()> {
        if country_header.is_none() {
            return Ok(());
        }
        self.mutate_properties(true, |props| props.apply_country_header(country_header.as_deref())).await
    }

    /// `clear_cache(company, tenant, env)` (spec §6): drop the
    /// installed rule set and persisted rules body/hash for this
    /// namespace, without touching events or properties.
    pub async fn clear_cache(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.rule_set = RuleSet::empty();
            let now = now_millis();
            let events = state.events.snapshot();
            let changes = state.feature_table.evaluate(&state.rule_set, &events, &state.properties.user, &state.properties.device, now);
            self.dispatch_changes(changes, &state.feature_table);
        }
        self.persistence.remove(&self.namespaced_key(persistence::keys::RULES_BODY))?;
        self.persistence.remove(&self.namespaced_key(persistence::keys::RULES_HASH))?;
        Ok(())
    }

    pub async fn clear_event_history(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.events.clear();
        }
        self.flush_events().await
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    /// Force an immediate write-through of events and properties,
    /// bypassing the debounced background writer — used by short-lived
    /// callers (the CLI) that exit before the debounce window elapses.
    pub async fn flush(&self) -> Result<()> {
        self.flush_events().await?;
        self.persist_properties().await
    }

    pub async fn feature_snapshot(&self) -> HashMap<String, String> {
        self.state.lock().await.feature_table.snapshot()
    }
}

fn spawn_notification_task(mut rx: mpsc::UnboundedReceiver<NotificationJob>) {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            for listener in job.listeners {
                listener(&job.feature, job.value.as_deref());
            }
        }
    });
}

fn load_events(persistence: &Arc<dyn PersistenceBackend>, namespace: &str, policy: RetentionPolicy) -> Result<EventStore> {
    let mut store = EventStore::new(policy);
    let key = format!("{namespace}/{}", persistence::keys::EVENTS);
    if let Some(bytes) = persistence.get(&key)? {
        match serde_json::from_slice::<Vec<EventRecord>>(&bytes) {
            Ok(events) => store.restore(events),
            Err(err) => tracing::warn!(error = %err, "persisted event log failed to parse — starting empty"),
        }
    }
    Ok(store)
}

fn load_properties(persistence: &Arc<dyn PersistenceBackend>, namespace: &str) -> Result<Properties> {
    let key = format!("{namespace}/{}", persistence::keys::PROPERTIES);
    if let Some(bytes) = persistence.get(&key)? {
        if let Ok(properties) = serde_json::from_slice::<Properties>(&bytes) {
            return Ok(properties);
        }
        tracing::warn!("persisted properties failed to parse — starting empty");
    }
    Ok(Properties::default())
}
