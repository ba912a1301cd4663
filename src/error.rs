//! Pipeline error taxonomy.
//!
//! Every component boundary converts its failures into one of these kinds;
//! the original cause is carried in the message for logging but callers only
//! dispatch on the kind and its [`ErrorClass`]. The orchestrator's state
//! machine branches on `class()` rather than on thrown exceptions: transient
//! kinds requeue the job, fatal kinds terminate the analysis, degraded kinds
//! fall through to the backing store.

use std::time::Duration;

use uuid::Uuid;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// How an error propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable within the same run or via the queue's retry schedule.
    Transient,
    /// Terminates the current job; never retried.
    Fatal,
    /// Bypass the failing component and continue (cache-only failures).
    Degraded,
    /// Caller bug; surfaces as an internal failure.
    ProgrammerError,
}

/// Transport-agnostic error kinds shared by every component.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input too large: {len} bytes exceeds the {max} byte limit")]
    InputTooLarge { len: usize, max: usize },

    #[error("bad range: {start}..{end} over text of {len} chars")]
    BadRange { start: usize, end: usize, len: usize },

    #[error("operation canceled")]
    Canceled,

    #[error("queue '{queue}' is over its hard limit ({depth} jobs)")]
    Backpressure { queue: &'static str, depth: usize },

    #[error("response body exceeds the {limit} byte fetch limit")]
    Oversize { limit: usize },

    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("a non-terminal analysis already exists for version {version_id}")]
    AnalysisInProgress { version_id: Uuid },

    #[error("fingerprint matches the latest stored version")]
    FingerprintUnchanged,

    #[error("fingerprint drift: version recorded {recorded}, recomputed {actual}")]
    FingerprintDrift { recorded: String, actual: String },

    #[error("LLM call timed out")]
    LlmTimeout,

    #[error("LLM upstream returned status {0}")]
    LlmUpstream(u16),

    #[error("LLM refused the request: {0}")]
    LlmRefused(String),

    #[error("LLM response could not be parsed: {0}")]
    LlmMalformed(String),

    #[error("vector index unavailable: {0}")]
    VectorUnavailable(String),

    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Propagation class for this kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Canceled
            | Error::Backpressure { .. }
            | Error::RateLimited { .. }
            | Error::Network(_)
            | Error::Conflict(_)
            | Error::AnalysisInProgress { .. }
            | Error::LlmTimeout
            | Error::LlmUpstream(_)
            | Error::VectorUnavailable(_) => ErrorClass::Transient,

            Error::CacheUnavailable(_) => ErrorClass::Degraded,

            Error::BadRange { .. } => ErrorClass::ProgrammerError,

            Error::InputTooLarge { .. }
            | Error::Oversize { .. }
            | Error::NotFound(_)
            | Error::FingerprintUnchanged
            | Error::FingerprintDrift { .. }
            | Error::LlmRefused(_)
            | Error::LlmMalformed(_)
            | Error::Unauthorized(_)
            | Error::Forbidden(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Whether the queue should redeliver the job after this error.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable label persisted as `error_kind` on failed rows and dead letters.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::InputTooLarge { .. } => "input_too_large",
            Error::BadRange { .. } => "bad_range",
            Error::Canceled => "canceled",
            Error::Backpressure { .. } => "backpressure",
            Error::Oversize { .. } => "oversize",
            Error::RateLimited { .. } => "rate_limited",
            Error::Network(_) => "network",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::AnalysisInProgress { .. } => "analysis_in_progress",
            Error::FingerprintUnchanged => "fingerprint_unchanged",
            Error::FingerprintDrift { .. } => "fingerprint_drift",
            Error::LlmTimeout => "llm_timeout",
            Error::LlmUpstream(_) => "llm_upstream",
            Error::LlmRefused(_) => "llm_refused",
            Error::LlmMalformed(_) => "llm_malformed",
            Error::VectorUnavailable(_) => "vector_unavailable",
            Error::CacheUnavailable(_) => "cache_unavailable",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound("no matching row".into()),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
