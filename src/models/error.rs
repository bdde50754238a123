//! Error types for palisade.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (invalid input, not found)
//! - I^B materialized: Infrastructure failures (network, timeout, rate limit)
//! - K_i violated: Internal invariant violations (bugs)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for palisade.
#[derive(Debug, Error)]
pub enum EngineError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Stage not found: {stage} (job {job_id})")]
    StageNotFound { job_id: String, stage: String },

    #[error("Dead letter entry not found: {0}")]
    EntryNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed {
        stage: String,
        message: String,
        kind: FailureKind,
    },

    #[error("Circuit '{dependency}' is OPEN: retry after {retry_after_secs:.1}s")]
    CircuitOpen {
        dependency: String,
        retry_after_secs: f64,
    },

    #[error("Retries exhausted for stage '{stage}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last_error: String,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B UNRESOLVABLE — Truly unknown failure
    // ═══════════════════════════════════════════════════════════════════

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a stage failure with an explicit classification.
    pub fn stage(stage: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            message: message.into(),
            kind,
        }
    }
}

/// Fixed failure taxonomy for stage execution errors.
///
/// K_i: Every stage failure maps to exactly one kind; retryability is a
/// static property of the kind, not of the individual error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request timed out or the connection dropped
    NetworkTimeout,
    /// Upstream returned 429 / rate limit
    ApiRateLimit,
    /// Upstream temporarily unavailable (502/503)
    ResourceUnavailable,
    /// Input rejected by validation — retrying cannot help
    InvalidInput,
    /// Authentication or authorization failed — retrying cannot help
    AuthFailure,
    /// Process or upstream ran out of memory
    OutOfMemory,
    /// Anything we could not classify
    UnknownError,
}

impl FailureKind {
    /// Whether errors of this kind are worth retrying at all.
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::InvalidInput | Self::AuthFailure)
    }

    /// Stable snake_case label, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::ApiRateLimit => "api_rate_limit",
            Self::ResourceUnavailable => "resource_unavailable",
            Self::InvalidInput => "invalid_input",
            Self::AuthFailure => "auth_failure",
            Self::OutOfMemory => "out_of_memory",
            Self::UnknownError => "unknown_error",
        }
    }

    /// All kinds, for stats tables.
    pub fn all() -> [FailureKind; 7] {
        [
            Self::NetworkTimeout,
            Self::ApiRateLimit,
            Self::ResourceUnavailable,
            Self::InvalidInput,
            Self::AuthFailure,
            Self::OutOfMemory,
            Self::UnknownError,
        ]
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for palisade.
pub type Result<T> = std::result::Result<T, EngineError>;
