//! Failure classification.
//!
//! Epistemic foundation:
//! - K_i: Classification is pure and total — every error maps to a kind
//! - B_i: Upstream errors arrive as loosely structured text → substring rules
//! - I^B: Unrecognized failures default to UnknownError, never panic

use crate::models::{EngineError, FailureKind};

/// Classify an error value (message + type tag) into a [`FailureKind`].
///
/// Pure, total, side-effect free. Substring matching runs over both the
/// message and the type tag, lowercased; the first matching rule wins.
pub fn classify_parts(message: &str, type_tag: &str) -> FailureKind {
    let haystack = format!("{} {}", message.to_lowercase(), type_tag.to_lowercase());

    if contains_any(&haystack, &["timeout", "timed out", "connection"]) {
        FailureKind::NetworkTimeout
    } else if contains_any(&haystack, &["429", "rate limit", "rate-limit", "too many requests"]) {
        FailureKind::ApiRateLimit
    } else if contains_any(&haystack, &["503", "502", "unavailable", "bad gateway"]) {
        FailureKind::ResourceUnavailable
    } else if contains_any(&haystack, &["401", "403", "unauthorized", "forbidden", "auth"]) {
        FailureKind::AuthFailure
    } else if contains_any(&haystack, &["validation", "invalid", "type error", "valueerror"]) {
        FailureKind::InvalidInput
    } else if contains_any(&haystack, &["out of memory", "oom", "memory"]) {
        FailureKind::OutOfMemory
    } else {
        FailureKind::UnknownError
    }
}

/// Classify an [`EngineError`].
///
/// Errors that carry their kind keep it; everything else falls back to
/// message matching.
pub fn classify(error: &EngineError) -> FailureKind {
    match error {
        EngineError::StageFailed { kind, .. } => *kind,
        EngineError::CircuitOpen { .. } => FailureKind::ResourceUnavailable,
        EngineError::InvalidInput(_) => FailureKind::InvalidInput,
        other => classify_parts(&other.to_string(), type_tag(other)),
    }
}

fn type_tag(error: &EngineError) -> &'static str {
    match error {
        EngineError::Config(_) => "ConfigError",
        EngineError::InvalidInput(_) => "InvalidInput",
        EngineError::JobNotFound(_) => "JobNotFound",
        EngineError::StageNotFound { .. } => "StageNotFound",
        EngineError::EntryNotFound(_) => "EntryNotFound",
        EngineError::InvalidState(_) => "InvalidState",
        EngineError::ParseError(_) => "ParseError",
        EngineError::StageFailed { .. } => "StageFailed",
        EngineError::CircuitOpen { .. } => "CircuitOpen",
        EngineError::RetriesExhausted { .. } => "RetriesExhausted",
        EngineError::Io { .. } => "Io",
        EngineError::Internal(_) => "Internal",
        EngineError::Unknown(_) => "Unknown",
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_message_substring() {
        assert_eq!(
            classify_parts("request timed out after 30s", ""),
            FailureKind::NetworkTimeout
        );
        assert_eq!(
            classify_parts("upstream returned 429", ""),
            FailureKind::ApiRateLimit
        );
        assert_eq!(
            classify_parts("503 service unavailable", ""),
            FailureKind::ResourceUnavailable
        );
        assert_eq!(
            classify_parts("401 unauthorized", ""),
            FailureKind::AuthFailure
        );
        assert_eq!(
            classify_parts("schema validation failed", ""),
            FailureKind::InvalidInput
        );
        assert_eq!(
            classify_parts("worker killed: out of memory", ""),
            FailureKind::OutOfMemory
        );
    }

    #[test]
    fn classifies_by_type_tag() {
        assert_eq!(
            classify_parts("something odd", "ConnectionError"),
            FailureKind::NetworkTimeout
        );
        assert_eq!(
            classify_parts("bad field", "ValueError"),
            FailureKind::InvalidInput
        );
    }

    #[test]
    fn unrecognized_defaults_to_unknown() {
        assert_eq!(
            classify_parts("the frobnicator exploded", "Mystery"),
            FailureKind::UnknownError
        );
        assert_eq!(classify_parts("", ""), FailureKind::UnknownError);
    }

    #[test]
    fn engine_errors_keep_their_kind() {
        let err = EngineError::stage("media", FailureKind::OutOfMemory, "cuda OOM");
        assert_eq!(classify(&err), FailureKind::OutOfMemory);

        let open = EngineError::CircuitOpen {
            dependency: "render_api".to_string(),
            retry_after_secs: 30.0,
        };
        assert_eq!(classify(&open), FailureKind::ResourceUnavailable);
    }
}
