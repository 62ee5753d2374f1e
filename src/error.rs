//! Error types for the paperline library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot proceed at all (corrupt
//!   checkpoint file, invalid configuration, missing credential for the
//!   selected provider). Returned as `Err(PipelineError)` from
//!   [`crate::orchestrator::Pipeline::run`] before any stage is dispatched.
//!
//! * [`StageError`] — **Per-item**: one item failed one stage (download
//!   exhausted its retries, OCR worker crashed or timed out, analysis
//!   provider rejected the request) but every other item is unaffected.
//!   Recorded in the checkpoint store and surfaced through
//!   [`crate::report::RunReport`] so callers can rerun only the failures.
//!
//! The separation lets callers decide their own tolerance: abort on the first
//! item failure, log and continue, or collect everything for a post-run report.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the paperline library.
///
/// Item-level failures use [`StageError`] and are recorded in the checkpoint
/// store rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Checkpoint errors ─────────────────────────────────────────────────
    /// The persisted checkpoint file exists but cannot be parsed.
    ///
    /// The orchestrator halts rather than guessing: silently dropping
    /// completion records would re-run (and possibly clobber) finished work.
    #[error("Checkpoint file '{path}' is corrupt: {detail}\nFix or remove the file, then rerun.")]
    CorruptCheckpoint { path: PathBuf, detail: String },

    /// Could not persist the checkpoint file.
    #[error("Failed to write checkpoint file '{path}': {source}")]
    CheckpointWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catalog errors ────────────────────────────────────────────────────
    /// The catalog source could not produce item descriptors.
    #[error("Catalog '{path}' is unavailable: {detail}")]
    CatalogUnavailable { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The selected consumption provider needs a credential and none was found.
    #[error("Provider '{provider}' requires an API key.\nPass --api-key or set OPENAI_API_KEY.")]
    MissingCredential { provider: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create a destination directory or write an output artifact.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A per-item stage failure.
///
/// Stored in the checkpoint record (as its `reason` string) and in
/// [`crate::report::RunReport::failures`]. The run continues to the next item.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum StageError {
    /// Network-level or 5xx fetch failure — retried up to the configured budget.
    #[error("transient fetch error: {reason}")]
    TransientFetch { reason: String },

    /// Fetch failure that retrying cannot fix (404, payload is not a PDF).
    #[error("permanent fetch error: {reason}")]
    PermanentFetch { reason: String },

    /// The OCR worker did not finish within the configured timeout and was killed.
    #[error("transform timed out after {secs}s")]
    TransformTimeout { secs: u64 },

    /// The OCR worker exited nonzero or died on a signal.
    ///
    /// `diagnostics` carries the captured stdout/stderr — accelerator
    /// failures are often only diagnosable post hoc, so it is never discarded.
    #[error("transform crashed (exit {exit_code:?}): {diagnostics}")]
    TransformCrash {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    /// The analysis provider reported a failure for this item.
    #[error("consumption failed ({provider}): {reason}")]
    Consumption { provider: String, reason: String },
}

impl StageError {
    /// Whether the fetch retry loop should try again after this error.
    ///
    /// Only [`StageError::TransientFetch`] is retryable; everything else is
    /// either permanent or belongs to a stage with its own failure policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::TransientFetch { .. })
    }
}
