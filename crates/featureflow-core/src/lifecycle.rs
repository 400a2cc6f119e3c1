//! C7 — Rule Lifecycle: fetch pointer, compare against the cached
//! content hash, install or no-op, persist, and drive the auto-refresh
//! timer (spec §4.6). Concurrent `refresh_rules()` callers collapse
//! onto one outbound fetch (spec §8 Testable Property 12), grounded on
//! the teacher's `tokio::spawn` + `broadcast::channel` notification
//! pattern in `server/mod.rs`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::{broadcast, Mutex};

use crate::event_store::now_millis;
use crate::persistence::{self, PersistenceBackend};
use crate::rules::{RuleDocument, RuleSet};
use featureflow_transport::{PointerRequest, RulesTransport};

/// Auto-refresh interval bounds (spec §4.6).
pub const MIN_POLL_INTERVAL_MS: u64 = 60_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;
/// Timer jitter fraction (spec §4.6 "jittered by ±10%").
const JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// No transport configured (local mode) — nothing to do.
    NoTransport,
    /// Pointer version matched the cached hash; no document re-fetch.
    CacheHit { country_header: Option<String> },
    /// A new immutable document was fetched, parsed, and installed.
    RulesUpdated { rule_set: RuleSet, country_header: Option<String> },
}

type BroadcastMsg = Result<RefreshOutcome, String>;

pub struct RuleLifecycle {
    persistence: Arc<dyn PersistenceBackend>,
    namespace: String,
    transport: Option<Arc<dyn RulesTransport>>,
    pointer_request: Option<PointerRequest>,
    poll_interval_ms: Arc<AtomicU64>,
    last_successful_fetch_millis: Arc<AtomicI64>,
    single_flight_leader: Arc<Mutex<Option<broadcast::Sender<BroadcastMsg>>>>,
}

impl RuleLifecycle {
    pub fn new(
        persistence: Arc<dyn PersistenceBackend>,
        namespace: String,
        transport: Option<Arc<dyn RulesTransport>>,
        pointer_request: Option<PointerRequest>,
        initial_poll_interval_ms: u64,
    ) -> Self {
        Self {
            persistence,
            namespace,
            transport,
            pointer_request,
            poll_interval_ms: Arc::new(AtomicU64::new(
                initial_poll_interval_ms.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
            )),
            last_successful_fetch_millis: Arc::new(AtomicI64::new(0)),
            single_flight_leader: Arc::new(Mutex::new(None)),
        }
    }

    /// On startup: attempt to load a persisted rule document and
    /// install it as the active rule set. `None` if nothing was
    /// persisted, or if what was persisted fails to parse (treated as
    /// "start empty", not a fatal error — spec §9 Open Question).
    pub fn initial_load(&self) -> Result<Option<RuleSet>> {
        let key = format!("{}/{}", self.namespace, persistence::keys::RULES_BODY);
        let Some(bytes) = self.persistence.get(&key).context("reading persisted rule document")? else {
            return Ok(None);
        };
        match RuleDocument::parse(&bytes) {
            Ok(doc) => Ok(Some(RuleSet::from_document(doc))),
            Err(err) => {
                tracing::warn!(error = %err, "persisted rule document failed to parse — starting empty");
                Ok(None)
            }
        }
    }

    /// Local mode (spec §4.6): parse and install a host-supplied rule
    /// document string directly, bypassing the network entirely.
    pub fn install_local(&self, rules_json: &str) -> Result<RuleSet> {
        let doc = RuleDocument::parse(rules_json.as_bytes())
            .map_err(|err| anyhow::anyhow!("local rule document failed to parse: {err}"))?;
        Ok(RuleSet::from_document(doc))
    }

    pub fn current_poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms.load(Ordering::SeqCst)
    }

    /// The interval to sleep before the next auto-refresh attempt,
    /// jittered by ±10% (spec §4.6), always within the configured
    /// bounds.
    pub fn jittered_poll_interval(&self) -> Duration {
        let base = self.current_poll_interval_ms() as f64;
        let jitter = base * JITTER_FRACTION;
        let offset = rand::rng().random_range(-jitter..=jitter);
        let millis = (base + offset).clamp(MIN_POLL_INTERVAL_MS as f64, MAX_POLL_INTERVAL_MS as f64);
        Duration::from_millis(millis as u64)
    }

    /// Whether a feature lookup should opportunistically trigger a
    /// background fetch (spec §4.6): true once the poll interval has
    /// elapsed since the last successful fetch.
    pub fn should_opportunistic_fetch(&self, now_millis: i64) -> bool {
        if self.transport.is_none() {
            return false;
        }
        let last = self.last_successful_fetch_millis.load(Ordering::SeqCst);
        now_millis.saturating_sub(last) >= self.current_poll_interval_ms() as i64
    }

    /// Run a fetch-and-compare cycle. Concurrent callers collapse onto
    /// the single in-flight attempt (spec Testable Property 12): the
    /// fetch itself runs on a spawned task so a cancelled caller never
    /// orphans followers waiting on the result.
    pub async fn refresh_rules(&self, current_hash: &str) -> Result<RefreshOutcome> {
        let mut guard = self.single_flight_leader.lock().await;
        if let Some(tx) = guard.as_ref() {
            let mut rx = tx.subscribe();
            drop(guard);
            return recv_outcome(&mut rx).await;
        }

        let (tx, _rx) = broadcast::channel(1);
        *guard = Some(tx.clone());
        drop(guard);

        let transport = self.transport.clone();
        let request = self.pointer_request.clone();
        let persistence = self.persistence.clone();
        let namespace = self.namespace.clone();
        let current_hash = current_hash.to_string();
        let poll_interval_ms = self.poll_interval_ms.clone();
        let last_successful_fetch_millis = self.last_successful_fetch_millis.clone();
        let leader_slot = self.single_flight_leader.clone();

        let handle = tokio::spawn(async move {
            let outcome = do_fetch(
                transport,
                request,
                persistence,
                &namespace,
                &current_hash,
                &poll_interval_ms,
                &last_successful_fetch_millis,
            )
            .await;
            let msg: BroadcastMsg = outcome.map_err(|e| format!("{e:#}"));
            let _ = tx.send(msg.clone());
            *leader_slot.lock().await = None;
            msg
        });

        match handle.await {
            Ok(msg) => msg.map_err(|e| anyhow::anyhow!(e)),
            Err(join_err) => Err(anyhow::anyhow!("refresh task panicked: {join_err}")),
        }
    }
}

async fn recv_outcome(rx: &mut broadcast::Receiver<BroadcastMsg>) -> Result<RefreshOutcome> {
    match rx.recv().await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(message)) => Err(anyhow::anyhow!(message)),
        Err(err) => Err(anyhow::anyhow!("refresh broadcast closed unexpectedly: {err}")),
    }
}

#[allow(clippy::too_many_arguments)]
async fn do_fetch(
    transport: Option<Arc<dyn RulesTransport>>,
    request: Option<PointerRequest>,
    persistence: Arc<dyn PersistenceBackend>,
    namespace: &str,
    current_hash: &str,
    poll_interval_ms: &AtomicU64,
    last_successful_fetch_millis: &AtomicI64,
) -> Result<RefreshOutcome> {
    let (transport, request) = match (transport, request) {
        (Some(t), Some(r)) => (t, r),
        _ => return Ok(RefreshOutcome::NoTransport),
    };

    // A fetch failure of any kind leaves the installed rule set intact
    // (spec §7 Transport errors) — the `?` here just propagates to the
    // caller, which does not touch the active `RuleSet` on `Err`.
    let pointer_response = transport.fetch_pointer(&request).await.context("fetching pointer document")?;

    if let Some(secs) = pointer_response.pointer.min_poll_interval_secs {
        let floor_ms = secs.saturating_mul(1000).clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        poll_interval_ms.fetch_max(floor_ms, Ordering::SeqCst);
    }

    let version = if pointer_response.not_modified {
        current_hash.to_string()
    } else {
        pointer_response.pointer.version.clone()
    };

    last_successful_fetch_millis.store(now_millis(), Ordering::SeqCst);
    persistence
        .put(
            &format!("{namespace}/{}", persistence::keys::RULES_CACHE_TIMESTAMP),
            now_millis().to_string().as_bytes(),
        )
        .context("persisting rules cache timestamp")?;

    if version == current_hash {
        return Ok(RefreshOutcome::CacheHit { country_header: pointer_response.country_header });
    }

    let (body, _etag) = transport
        .fetch_rules_document(&version, &request)
        .await
        .context("fetching rules document")?;
    let doc = RuleDocument::parse(&body).map_err(|err| anyhow::anyhow!("{err}"))?;
    let rule_set = RuleSet::from_document(doc);

    persistence
        .put(&format!("{namespace}/{}", persistence::keys::RULES_BODY), &body)
        .context("persisting rules body")?;
    persistence
        .put(
            &format!("{namespace}/{}", persistence::keys::RULES_HASH),
            rule_set.content_hash.as_bytes(),
        )
        .context("persisting rules content hash")?;

    Ok(RefreshOutcome::RulesUpdated { rule_set, country_header: pointer_response.country_header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistenceBackend;
    use async_trait::async_trait;
    use featureflow_transport::{PointerDocument, PointerResponse};
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        pointer: PointerDocument,
        body: Vec<u8>,
        call_count: AtomicUsize,
    }

    #[async_trait]
    impl RulesTransport for FakeTransport {
        async fn fetch_pointer(&self, _request: &PointerRequest) -> Result<PointerResponse> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            Ok(PointerResponse {
                pointer: self.pointer.clone(),
                country_header: Some("DE".to_string()),
                not_modified: false,
            })
        }

        async fn fetch_rules_document(
            &self,
            _version: &str,
            _request: &PointerRequest,
        ) -> Result<(Vec<u8>, Option<String>)> {
            Ok((self.body.clone(), None))
        }
    }

    fn request() -> PointerRequest {
        PointerRequest {
            base_url: "https://example.com".to_string(),
            company: "acme".to_string(),
            tenant: "core".to_string(),
            environment: "prod".to_string(),
            api_key: "k".to_string(),
        }
    }

    #[tokio::test]
    async fn cache_hit_does_not_refetch_document_property_13() {
        let body = br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#.to_vec();
        let doc = RuleDocument::parse(&body).unwrap();
        let hash = RuleSet::from_document(doc).content_hash;

        let transport = Arc::new(FakeTransport {
            pointer: PointerDocument { version: hash.clone(), ..Default::default() },
            body,
            call_count: AtomicUsize::new(0),
        });
        let lifecycle = RuleLifecycle::new(
            Arc::new(InMemoryPersistenceBackend::default()),
            "acme/core/prod".to_string(),
            Some(transport),
            Some(request()),
            300_000,
        );

        let outcome = lifecycle.refresh_rules(&hash).await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::CacheHit { .. }));
    }

    #[tokio::test]
    async fn version_mismatch_fetches_and_installs_property_3() {
        let body = br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#.to_vec();
        let doc = RuleDocument::parse(&body).unwrap();
        let hash = RuleSet::from_document(doc).content_hash;

        let transport = Arc::new(FakeTransport {
            pointer: PointerDocument { version: hash.clone(), ..Default::default() },
            body,
            call_count: AtomicUsize::new(0),
        });
        let lifecycle = RuleLifecycle::new(
            Arc::new(InMemoryPersistenceBackend::default()),
            "acme/core/prod".to_string(),
            Some(transport),
            Some(request()),
            300_000,
        );

        let outcome = lifecycle.refresh_rules("stale-hash").await.unwrap();
        match outcome {
            RefreshOutcome::RulesUpdated { rule_set, .. } => assert_eq!(rule_set.content_hash, hash),
            other => panic!("expected RulesUpdated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_refresh_calls_collapse_to_one_fetch_property_12() {
        let body = br#"{"features":{"f":[{"value":"v","conditions":{}}]}}"#.to_vec();
        let transport = Arc::new(FakeTransport {
            pointer: PointerDocument { version: "v1".to_string(), ..Default::default() },
            body,
            call_count: AtomicUsize::new(0),
        });
        let lifecycle = Arc::new(RuleLifecycle::new(
            Arc::new(InMemoryPersistenceBackend::default()),
            "acme/core/prod".to_string(),
            Some(transport.clone()),
            Some(request()),
            300_000,
        ));

        let a = { let lc = lifecycle.clone(); tokio::spawn(async move { lc.refresh_rules("none").await }) };
        let b = { let lc = lifecycle.clone(); tokio::spawn(async move { lc.refresh_rules("none").await }) };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(transport.call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn min_poll_interval_is_raised_never_lowered_property_14() {
        let body = br#"{"features":{}}"#.to_vec();
        let transport = Arc::new(FakeTransport {
            pointer: PointerDocument {
                version: "v1".to_string(),
                min_poll_interval_secs: Some(3_600),
                ..Default::default()
            },
            body,
            call_count: AtomicUsize::new(0),
        });
        let lifecycle = RuleLifecycle::new(
            Arc::new(InMemoryPersistenceBackend::default()),
            "acme/core/prod".to_string(),
            Some(transport),
            Some(request()),
            60_000,
        );
        lifecycle.refresh_rules("none").await.unwrap();
        assert_eq!(lifecycle.current_poll_interval_ms(), 3_600_000);
    }

    #[tokio::test]
    async fn no_transport_is_a_noop() {
        let lifecycle = RuleLifecycle::new(
            Arc::new(InMemoryPersistenceBackend::default()),
            "acme/core/prod".to_string(),
            None,
            None,
            300_000,
        );
        let outcome = lifecycle.refresh_rules("any").await.unwrap();
        assert!(matches!(outcome, RefreshOutcome::NoTransport));
    }
}
