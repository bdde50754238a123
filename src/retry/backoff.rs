//! Backoff policies keyed by failure kind.
//!
//! Epistemic foundation:
//! - K_i: delay(attempt) = min(base * 2^attempt, max), ± up to 25% jitter,
//!   clamped to [0, max]
//! - K_i: Non-retryable kinds carry max_retries = 0
//! - I^B: Jitter desynchronizes retry storms across concurrent jobs

use crate::models::{EngineConfig, FailureKind};
use rand::Rng;
use std::time::Duration;

/// Jitter band as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.25;

/// Retry policy for one failure kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Whether this kind is worth retrying at all
    pub retryable: bool,
    /// Attempts allowed before escalation (0 = never retry)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

impl BackoffPolicy {
    fn new(retryable: bool, max_retries: u32, base_secs: f64, max_secs: f64) -> Self {
        Self {
            retryable,
            max_retries,
            base_delay: Duration::from_secs_f64(base_secs),
            max_delay: Duration::from_secs_f64(max_secs),
        }
    }

    /// Built-in policy for a failure kind.
    pub fn for_kind(kind: FailureKind) -> Self {
        match kind {
            FailureKind::NetworkTimeout => Self::new(true, 5, 2.0, 60.0),
            FailureKind::ApiRateLimit => Self::new(true, 8, 5.0, 300.0),
            FailureKind::ResourceUnavailable => Self::new(true, 6, 10.0, 600.0),
            FailureKind::OutOfMemory => Self::new(true, 2, 30.0, 120.0),
            FailureKind::UnknownError => Self::new(true, 3, 5.0, 60.0),
            // Retrying cannot fix bad input or bad credentials.
            FailureKind::InvalidInput => Self::new(false, 0, 0.0, 0.0),
            FailureKind::AuthFailure => Self::new(false, 0, 0.0, 0.0),
        }
    }

    /// Policy for a kind with config-file overrides applied.
    ///
    /// Overrides never make a non-retryable kind retryable.
    pub fn from_config(kind: FailureKind, config: &EngineConfig) -> Self {
        let mut policy = Self::for_kind(kind);
        if !policy.retryable {
            return policy;
        }
        if let Some(overrides) = config.retry.get(kind.as_str()) {
            if let Some(max) = overrides.max_retries {
                policy.max_retries = max;
            }
            if let Some(base) = overrides.base_delay_secs {
                policy.base_delay = Duration::from_secs_f64(base.max(0.0));
            }
            if let Some(max) = overrides.max_delay_secs {
                policy.max_delay = Duration::from_secs_f64(max.max(0.0));
            }
        }
        policy
    }

    /// Compute the delay before retry number `attempt` (0-indexed), with
    /// jitter applied. Always within [0, max_delay].
    pub fn delay(&self, attempt: u32) -> Duration {
        let jittered = self.delay_raw(attempt).as_secs_f64() * jitter_factor();
        Duration::from_secs_f64(jittered.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Exponential delay without jitter: min(base * 2^attempt, max).
    pub fn delay_raw(&self, attempt: u32) -> Duration {
        if !self.retryable {
            return Duration::ZERO;
        }
        // Cap the exponent so the multiplication cannot overflow.
        let factor = 2f64.powi(attempt.min(32) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

fn jitter_factor() -> f64 {
    let mut rng = rand::thread_rng();
    1.0 + rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION)
}
