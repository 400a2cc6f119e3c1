//! Host-supplied configuration for the feature-flag engine.
//!
//! Mirrors the shape of a typical SDK "init" call: identity
//! (company/tenant/environment/api key), retention knobs, and polling
//! behavior. Values are clamped to sane ranges rather than rejected —
//! only identity fields are validated hard enough to refuse
//! construction (spec §7 "Configuration errors").

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Minimum/maximum accepted values for the retention knobs (spec §3).
pub const MIN_MAX_EVENTS: u32 = 100;
pub const MAX_MAX_EVENTS: u32 = 100_000;
pub const DEFAULT_MAX_EVENTS: u32 = 5_000;

pub const MIN_MAX_EVENT_AGE_DAYS: u32 = 1;
pub const MAX_MAX_EVENT_AGE_DAYS: u32 = 365;
pub const DEFAULT_MAX_EVENT_AGE_DAYS: u32 = 7;

/// Poll interval bounds (spec §4.6 auto-refresh).
pub const MIN_POLL_INTERVAL_MS: u64 = 60_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5 * 60 * 1000;

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} must not contain whitespace (got {value:?})")]
    WhitespaceInId { field: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Host-provided configuration, equivalent to the arguments of
/// `initialize(company, tenant, env, api_key, ...)` in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub company: String,
    pub tenant: String,
    pub environment: String,
    pub api_key: String,
    pub auto_refresh: bool,
    pub poll_interval_ms: u64,
    pub session_timeout_ms: u64,
    pub max_events: u32,
    pub max_event_age_days: u32,
    pub debug: bool,
    /// When set, `initialize_local` reads the rule document from this
    /// path instead of fetching from the network.
    pub local_rules_path: Option<String>,
    /// Base URL for the pointer/rules-document transport (spec §1
    /// treats the transport itself as an external collaborator, so the
    /// wire format of this endpoint is left to `featureflow-transport`;
    /// this field just tells the engine where to point it).
    pub rules_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            company: String::new(),
            tenant: String::new(),
            environment: "production".to_string(),
            api_key: String::new(),
            auto_refresh: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            max_events: DEFAULT_MAX_EVENTS,
            max_event_age_days: DEFAULT_MAX_EVENT_AGE_DAYS,
            debug: false,
            local_rules_path: None,
            rules_base_url: String::new(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, applying `FEATUREFLOW_API_KEY` as an
    /// override for the `api_key` field (secrets don't belong in the
    /// checked-in config file).
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut cfg: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if let Ok(key) = std::env::var("FEATUREFLOW_API_KEY") {
            if !key.is_empty() {
                cfg.api_key = key;
            }
        }
        cfg.normalize();
        Ok(cfg)
    }

    /// Clamp retention/poll knobs into their accepted ranges (spec §3,
    /// §4.6). Called automatically by every loader; safe to call again
    /// after mutating fields by hand.
    pub fn normalize(&mut self) {
        self.max_events = self.max_events.clamp(MIN_MAX_EVENTS, MAX_MAX_EVENTS);
        self.max_event_age_days = self
            .max_event_age_days
            .clamp(MIN_MAX_EVENT_AGE_DAYS, MAX_MAX_EVENT_AGE_DAYS);
        self.poll_interval_ms = self
            .poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
    }

    /// Refuse-to-initialize validation (spec §7 Configuration errors):
    /// missing/blank company, tenant, or API key, or any identity field
    /// containing whitespace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.company.trim().is_empty() {
            return Err(ConfigError::MissingField("company"));
        }
        if self.tenant.trim().is_empty() {
            return Err(ConfigError::MissingField("tenant"));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("api_key"));
        }
        for (field, value) in [
            ("company", &self.company),
            ("tenant", &self.tenant),
            ("environment", &self.environment),
        ] {
            if value.chars().any(char::is_whitespace) {
                return Err(ConfigError::WhitespaceInId {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validated construction used by the engine's `initialize` entry
    /// point: normalizes retention/poll knobs, then validates identity.
    pub fn build(mut self) -> Result<Self, ConfigError> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Namespace prefix used to derive persistence keys (spec §4.7,
    /// §6 "Persisted keys"): `company/tenant/environment`.
    pub fn namespace(&self) -> String {
        format!("{}/{}/{}", self.company, self.tenant, self.environment)
    }
}
