//! Closed error types that callers must match on at a crate boundary
//! (spec §7 "Parse errors" vs. everything else, which stays
//! `anyhow::Result`).

use thiserror::Error;

/// Failure parsing a fetched or persisted rule document. The lifecycle
/// (C7) always catches this and retains the previously installed rule
/// set, logging a warning (spec §9 Open Question decision).
#[derive(Debug, Error)]
pub enum RuleDocError {
    #[error("rule document does not match the canonical or legacy shape")]
    UnrecognizedShape,
    #[error("rule document is not valid JSON")]
    Json(#[from] serde_json::Error),
}
