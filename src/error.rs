//! Error types for the edgequake-scrape library.
//!
//! Two layers reflect two distinct failure modes:
//!
//! * [`BackendError`]: **Recoverable**: one backend attempt failed (network
//!   blip, truncated output, unparseable payload). The retry policy absorbs
//!   these; they only surface once retries are exhausted, converted into the
//!   matching [`ScrapeError`] variant.
//!
//! * [`ScrapeError`]: **Fatal**: the extraction is aborted. Every variant
//!   raised after the extraction started carries the partial
//!   [`ScrapeResponse`], so spend already incurred is reported rather than
//!   lost.
//!
//! [`PostprocessError`] is what a single postprocessing step returns; the
//! orchestrator wraps it into [`ScrapeError::Postprocessing`].

use crate::response::ScrapeResponse;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Whether a budget breach was caught before spending or after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetPhase {
    /// The projected cost of the next call would cross the ceiling; nothing
    /// was dispatched for that call.
    Projected,
    /// An accepted call already pushed spend past the ceiling; no further
    /// calls are allowed for this extraction.
    Incurred,
}

impl fmt::Display for BudgetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPhase::Projected => f.write_str("pre-dispatch"),
            BudgetPhase::Incurred => f.write_str("post-dispatch"),
        }
    }
}

/// All fatal errors returned by the scraper.
#[derive(Debug, Error)]
pub enum ScrapeError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The document to extract from is empty.
    #[error("Document is empty; nothing to extract.\nCheck the HTML reduction step kept some content.")]
    EmptyDocument,

    /// Estimated prompt does not fit the model's context window.
    #[error("Input too large for '{model}': ~{tokens} tokens, context window is {limit}.\nSet an auto-split length or pick a model with a larger window.")]
    InputTooLarge {
        model: String,
        tokens: usize,
        limit: usize,
        response: Box<ScrapeResponse>,
    },

    // ── Budget ────────────────────────────────────────────────────────────
    /// The cost ceiling was (or would be) crossed.
    #[error("Budget exceeded ({phase}): spent ${total_cost:.4}, next call ~${projected:.4}, ceiling ${max_cost:.4}")]
    BudgetExceeded {
        phase: BudgetPhase,
        projected: f64,
        total_cost: f64,
        max_cost: f64,
        response: Box<ScrapeResponse>,
    },

    // ── Backend errors (after retry exhaustion) ──────────────────────────
    /// Transport-level failure on every attempt.
    #[error("Backend call to '{model}' failed after {attempts} attempt(s): {detail}")]
    BackendTransport {
        model: String,
        attempts: u32,
        detail: String,
        response: Box<ScrapeResponse>,
    },

    /// The model stopped before producing a complete result on every attempt.
    #[error("Output from '{model}' was truncated on all {attempts} attempt(s).\nRaise max_output_tokens or split the document.")]
    TruncatedOutput {
        model: String,
        attempts: u32,
        response: Box<ScrapeResponse>,
    },

    /// The model never produced a parseable payload.
    #[error("Output from '{model}' was not valid JSON after {attempts} attempt(s): {detail}")]
    MalformedOutput {
        model: String,
        attempts: u32,
        detail: String,
        response: Box<ScrapeResponse>,
    },

    // ── Result errors ─────────────────────────────────────────────────────
    /// A postprocessing step rejected the result.
    #[error("Postprocessor '{step}' rejected the result: {detail}")]
    Postprocessing {
        step: String,
        detail: String,
        response: Box<ScrapeResponse>,
    },

    /// Chunk payloads have shapes that cannot be merged unambiguously.
    #[error("Cannot merge chunk results: {detail}\nChoose an explicit merge policy for this schema.")]
    MergeAmbiguity {
        detail: String,
        response: Box<ScrapeResponse>,
    },

    /// The caller cancelled the extraction.
    #[error("Extraction cancelled")]
    Cancelled { response: Box<ScrapeResponse> },

    // ── Config / I/O ──────────────────────────────────────────────────────
    /// Builder or construction-time validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reading a schema/template or writing output failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ScrapeError {
    /// Stable, machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::EmptyDocument => "invalid_input",
            ScrapeError::InputTooLarge { .. } => "input_too_large",
            ScrapeError::BudgetExceeded { .. } => "budget_exceeded",
            ScrapeError::BackendTransport { .. } => "backend_transport",
            ScrapeError::TruncatedOutput { .. } => "truncated_output",
            ScrapeError::MalformedOutput { .. } => "malformed_output",
            ScrapeError::Postprocessing { .. } => "postprocessing",
            ScrapeError::MergeAmbiguity { .. } => "merge_ambiguity",
            ScrapeError::Cancelled { .. } => "cancelled",
            ScrapeError::InvalidConfig(_) => "invalid_config",
            ScrapeError::Io { .. } => "io",
        }
    }

    /// The partial response accrued before the failure, if the extraction
    /// had started.
    pub fn response(&self) -> Option<&ScrapeResponse> {
        match self {
            ScrapeError::InputTooLarge { response, .. }
            | ScrapeError::BudgetExceeded { response, .. }
            | ScrapeError::BackendTransport { response, .. }
            | ScrapeError::TruncatedOutput { response, .. }
            | ScrapeError::MalformedOutput { response, .. }
            | ScrapeError::Postprocessing { response, .. }
            | ScrapeError::MergeAmbiguity { response, .. }
            | ScrapeError::Cancelled { response } => Some(&**response),
            ScrapeError::EmptyDocument | ScrapeError::InvalidConfig(_) | ScrapeError::Io { .. } => {
                None
            }
        }
    }

    /// Whether the extraction had started when it failed. Input, config and
    /// I/O errors are raised before any model call is considered.
    pub fn started(&self) -> bool {
        self.response().is_some()
    }

    /// Dollars already spent when the error was raised.
    pub fn spend(&self) -> f64 {
        self.response().map_or(0.0, |r| r.response.total_cost)
    }

    /// Replace the attached partial response. Used when an error raised for
    /// one chunk is reported with the extraction-wide accounting.
    pub(crate) fn with_response(mut self, full: ScrapeResponse) -> Self {
        match &mut self {
            ScrapeError::InputTooLarge { response, .. }
            | ScrapeError::BudgetExceeded { response, .. }
            | ScrapeError::BackendTransport { response, .. }
            | ScrapeError::TruncatedOutput { response, .. }
            | ScrapeError::MalformedOutput { response, .. }
            | ScrapeError::Postprocessing { response, .. }
            | ScrapeError::MergeAmbiguity { response, .. }
            | ScrapeError::Cancelled { response } => **response = full,
            ScrapeError::EmptyDocument | ScrapeError::InvalidConfig(_) | ScrapeError::Io { .. } => {}
        }
        self
    }
}

/// A single failed backend attempt. Every variant is retryable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Network/provider-level failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call exceeded the configured per-call timeout.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The model hit its output limit before finishing.
    #[error("output truncated after {completion_tokens} completion tokens")]
    Truncated { completion_tokens: u64 },

    /// The output did not contain a parseable payload.
    #[error("malformed output: {0}")]
    Malformed(String),
}

/// A postprocessing step refused or failed to normalise the result.
#[derive(Debug, Clone, Error)]
#[error("{step}: {detail}")]
pub struct PostprocessError {
    pub step: String,
    pub detail: String,
}

impl PostprocessError {
    pub fn new(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            detail: detail.into(),
        }
    }
}
