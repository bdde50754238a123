//! Per-(job, stage) retry bookkeeping.
//!
//! Epistemic foundation:
//! - K_i: Attempt history is process-local; only retry_count survives in the
//!   checkpoint
//! - B_i: should_retry decides, the caller escalates — this module never
//!   touches the checkpoint store or the dead letter queue
//! - I^B: wait_for_retry is the sole suspension point and holds no locks

use crate::models::{EngineConfig, EngineError, FailureKind};
use crate::retry::{classify, BackoffPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// One recorded retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-indexed attempt number
    pub attempt_number: u32,
    /// Classified failure kind
    pub failure_kind: FailureKind,
    /// Error message at the time of failure
    pub error_message: String,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
    /// Delay scheduled before the next attempt
    pub delay_seconds: f64,
}

/// Ephemeral retry state for one (job, stage) pair.
///
/// Rebuilt per process lifetime; the durable retry_count lives in the
/// stage checkpoint.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub job_id: String,
    pub stage_name: String,
    pub attempts: Vec<RetryAttempt>,
    pub max_retries_reached: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryState {
    fn new(job_id: &str, stage_name: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage_name: stage_name.to_string(),
            attempts: Vec::new(),
            max_retries_reached: false,
            next_retry_at: None,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Retry decision logic for a single (job, stage) pair.
///
/// Composes the classifier and the backoff calculator: `should_retry`
/// answers "retry after a delay" vs "exhausted"; `record_attempt` appends
/// bookkeeping; `wait_for_retry` suspends for the computed delay.
pub struct RetryStrategy {
    state: RetryState,
    config: EngineConfig,
    pending_delay: Option<Duration>,
}

impl RetryStrategy {
    pub fn new(job_id: &str, stage_name: &str, config: EngineConfig) -> Self {
        Self {
            state: RetryState::new(job_id, stage_name),
            config,
            pending_delay: None,
        }
    }

    /// Whether another attempt is worthwhile for this error.
    ///
    /// False for non-retryable kinds on the very first attempt (their
    /// policies carry max_retries = 0).
    pub fn should_retry(&self, error: &EngineError) -> bool {
        let kind = classify(error);
        let policy = BackoffPolicy::from_config(kind, &self.config);
        policy.retryable && self.state.attempt_count() < policy.max_retries
    }

    /// Record a failed attempt and schedule the next retry delay.
    pub fn record_attempt(&mut self, error: &EngineError) -> RetryAttempt {
        let kind = classify(error);
        let policy = BackoffPolicy::from_config(kind, &self.config);
        let attempt_number = self.state.attempt_count() + 1;
        let delay = policy.delay(self.state.attempt_count());

        let attempt = RetryAttempt {
            attempt_number,
            failure_kind: kind,
            error_message: error.to_string(),
            timestamp: Utc::now(),
            delay_seconds: delay.as_secs_f64(),
        };

        debug!(
            job_id = %self.state.job_id,
            stage = %self.state.stage_name,
            attempt = attempt_number,
            kind = %kind,
            delay_secs = delay.as_secs_f64(),
            "Recorded retry attempt"
        );

        self.state.attempts.push(attempt.clone());
        self.state.max_retries_reached = self.state.attempt_count() >= policy.max_retries;
        self.state.next_retry_at =
            Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
        self.pending_delay = Some(delay);

        attempt
    }

    /// Suspend until the scheduled retry time.
    ///
    /// Checkpoint writes must happen before this call, not during it; no
    /// store lock is held across the sleep.
    pub async fn wait_for_retry(&mut self) {
        if let Some(delay) = self.pending_delay.take() {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Full attempt history for this (job, stage) pair.
    pub fn attempts(&self) -> &[RetryAttempt] {
        &self.state.attempts
    }

    /// Current ephemeral state.
    pub fn state(&self) -> &RetryState {
        &self.state
    }
}
