//! Pointer/rules-document transport (spec §4.6, §6). `RulesTransport`
//! is the seam the engine depends on; `HttpRulesTransport` is the
//! `reqwest`-backed production implementation, grounded on the
//! teacher's `crates/llm` client construction (shared `reqwest::Client`,
//! `Duration`-based timeout, JSON request bodies, custom headers).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default timeout for a rules-resource fetch (spec §5 "Cancellation
/// and timeouts").
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for auxiliary country-detection requests, where applicable.
pub const AUXILIARY_TIMEOUT: Duration = Duration::from_secs(5);

/// The small JSON document naming the current immutable rules document
/// by content hash (spec §3 "Pointer document", §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointerDocument {
    #[serde(default)]
    pub schema_version: Option<String>,
    pub version: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub feature_count: Option<i64>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub min_poll_interval_secs: Option<u64>,
}

/// What the engine passes to every fetch call: identity, API key, and
/// the base endpoint.
#[derive(Debug, Clone)]
pub struct PointerRequest {
    pub base_url: String,
    pub company: String,
    pub tenant: String,
    pub environment: String,
    pub api_key: String,
}

/// A successful pointer fetch: the parsed pointer plus the observed
/// `Country` response header, which populates the `country`
/// device-property (spec §3, §6).
#[derive(Debug, Clone)]
pub struct PointerResponse {
    pub pointer: PointerDocument,
    pub country_header: Option<String>,
    /// `true` when the server responded 304 Not Modified to a
    /// conditional `If-None-Match` request — equivalent to an unchanged
    /// `version` (DESIGN.md Open Question decision).
    pub not_modified: bool,
}

/// The seam between the engine and the network (spec §4.6 "[ADDED]").
#[async_trait]
pub trait RulesTransport: Send + Sync {
    async fn fetch_pointer(&self, request: &PointerRequest) -> Result<PointerResponse>;

    /// Fetch the immutable rules document named by `version`. Returns
    /// the raw JSON body and, if present, an ETag to remember for the
    /// next conditional pointer request.
    async fn fetch_rules_document(
        &self,
        version: &str,
        request: &PointerRequest,
    ) -> Result<(Vec<u8>, Option<String>)>;
}

/// `reqwest`-backed production transport.
pub struct HttpRulesTransport {
    client: reqwest::Client,
    last_pointer_etag: std::sync::Mutex<Option<String>>,
}

impl HttpRulesTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_FETCH_TIMEOUT)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            last_pointer_etag: std::sync::Mutex::new(None),
        })
    }

    fn pointer_url(request: &PointerRequest) -> String {
        format!(
            "{}/{}/{}/{}/pointer.json",
            request.base_url.trim_end_matches('/'),
            request.company,
            request.tenant,
            request.environment
        )
    }

    fn rules_document_url(request: &PointerRequest, version: &str) -> String {
        format!(
            "{}/{}/{}/{}/rules/{}.json",
            request.base_url.trim_end_matches('/'),
            request.company,
            request.tenant,
            request.environment,
            version
        )
    }
}

#[async_trait]
impl RulesTransport for HttpRulesTransport {
    async fn fetch_pointer(&self, request: &PointerRequest) -> Result<PointerResponse> {
        let mut builder = self
            .client
            .get(Self::pointer_url(request))
            .header("X-Api-Key", &request.api_key)
            .header("Cache-Control", "no-store");

        if let Some(etag) = self.last_pointer_etag.lock().expect("etag lock poisoned").clone() {
            builder = builder.header("If-None-Match", etag);
        }

        let response = builder.send().await.context("sending pointer request")?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            tracing::debug!(url = %Self::pointer_url(request), "pointer not modified");
            return Ok(PointerResponse {
                pointer: PointerDocument::default(),
                country_header: None,
                not_modified: true,
            });
        }

        let response = response.error_for_status().context("pointer request returned an error status")?;

        let country_header = response
            .headers()
            .get("Country")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(etag) = response.headers().get("ETag").and_then(|v| v.to_str().ok()) {
            *self.last_pointer_etag.lock().expect("etag lock poisoned") = Some(etag.to_string());
        }

        let pointer: PointerDocument = response.json().await.context("parsing pointer response body")?;

        Ok(PointerResponse { pointer, country_header, not_modified: false })
    }

    async fn fetch_rules_document(
        &self,
        version: &str,
        request: &PointerRequest,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let response = self
            .client
            .get(Self::rules_document_url(request, version))
            .header("X-Api-Key", &request.api_key)
            .header("Cache-Control", "no-store")
            .send()
            .await
            .context("sending rules-document request")?
            .error_for_status()
            .context("rules-document request returned an error status")?;

        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.bytes().await.context("reading rules-document body")?.to_vec();
        Ok((body, etag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_url_is_namespaced_by_identity() {
        let req = PointerRequest {
            base_url: "https://cdn.example.com".to_string(),
            company: "acme".to_string(),
            tenant: "core".to_string(),
            environment: "production".to_string(),
            api_key: "key".to_string(),
        };
        assert_eq!(
            HttpRulesTransport::pointer_url(&req),
            "https://cdn.example.com/acme/core/production/pointer.json"
        );
    }

    #[test]
    fn rules_document_url_is_content_addressed() {
        let req = PointerRequest {
            base_url: "https://cdn.example.com/".to_string(),
            company: "acme".to_string(),
            tenant: "core".to_string(),
            environment: "production".to_string(),
            api_key: "key".to_string(),
        };
        assert_eq!(
            HttpRulesTransport::rules_document_url(&req, "abc123"),
            "https://cdn.example.com/acme/core/production/rules/abc123.json"
        );
    }
}
