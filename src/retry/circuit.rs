//! Per-dependency circuit breakers.
//!
//! Epistemic foundation:
//! - K_i: closed → open → half_open → closed; open rejects synchronously
//! - K_i: One breaker per external dependency, shared across all jobs —
//!   the only intentional cross-job coupling in the engine
//! - I^B: Outage duration unknowable → cooldown then a single probe

use crate::alert::{AlertEvent, AlertSink};
use crate::models::{CircuitBreakerConfig, EngineError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected until the cooldown elapses
    Open,
    /// Cooldown elapsed; exactly one probe call is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    /// Set while the single half-open probe is outstanding
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            probe_in_flight: false,
        }
    }
}

/// Registry of circuit breakers, one per external dependency.
///
/// All jobs calling the same dependency share its breaker, so a downstream
/// outage stops being hammered by many jobs retrying simultaneously.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, BreakerInner>,
    config: CircuitBreakerConfig,
    alerts: Arc<dyn AlertSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            alerts,
        }
    }

    /// Check whether a call to `dependency` may proceed.
    ///
    /// Synchronous and non-blocking: an open circuit fails fast with
    /// [`EngineError::CircuitOpen`]. An elapsed cooldown moves the breaker
    /// to half-open and admits exactly one probe.
    pub fn check(&self, dependency: &str) -> Result<()> {
        let mut breaker = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(BreakerInner::new);

        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    Err(self.open_error(dependency, &breaker))
                } else {
                    breaker.probe_in_flight = true;
                    Ok(())
                }
            }
            CircuitState::Open => {
                let elapsed = breaker
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout() {
                    debug!(dependency, "Circuit cooldown elapsed, allowing probe");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.open_error(dependency, &breaker))
                }
            }
        }
    }

    /// Record a successful call: reset the failure count and close the
    /// circuit if it was half-open.
    pub fn record_success(&self, dependency: &str) {
        let mut breaker = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(BreakerInner::new);

        // Only the half-open probe closes the circuit; a success reported
        // while open (no call was admitted) must not short-circuit the
        // cooldown.
        if breaker.state == CircuitState::HalfOpen {
            debug!(dependency, "Probe succeeded, closing circuit");
            breaker.state = CircuitState::Closed;
        }
        breaker.failure_count = 0;
        breaker.probe_in_flight = false;
    }

    /// Record a failed call; opens the circuit at the failure threshold.
    pub fn record_failure(&self, dependency: &str) {
        let mut breaker = self
            .breakers
            .entry(dependency.to_string())
            .or_insert_with(BreakerInner::new);

        breaker.failure_count += 1;
        breaker.last_failure_time = Some(Instant::now());
        breaker.probe_in_flight = false;

        let should_open = match breaker.state {
            // A failed probe re-opens immediately.
            CircuitState::HalfOpen => true,
            CircuitState::Closed => breaker.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open && breaker.state != CircuitState::Open {
            breaker.state = CircuitState::Open;
            warn!(
                dependency,
                failures = breaker.failure_count,
                cooldown_secs = self.config.timeout_secs,
                "Circuit opened"
            );
            self.alerts.emit(AlertEvent::CircuitOpened {
                dependency: dependency.to_string(),
                failure_count: breaker.failure_count,
                cooldown_secs: self.config.timeout_secs,
            });
        }
    }

    /// Current state of a dependency's breaker (Closed if never used).
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.breakers
            .get(dependency)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn open_error(&self, dependency: &str, breaker: &BreakerInner) -> EngineError {
        let remaining = breaker
            .last_failure_time
            .map(|t| {
                self.config
                    .timeout()
                    .saturating_sub(t.elapsed())
                    .as_secs_f64()
            })
            .unwrap_or(0.0);
        EngineError::CircuitOpen {
            dependency: dependency.to_string(),
            retry_after_secs: remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::CollectingAlertSink;

    fn registry(threshold: u32, timeout_secs: u64) -> (CircuitBreakerRegistry, Arc<CollectingAlertSink>) {
        let sink = Arc::new(CollectingAlertSink::default());
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout_secs,
        };
        (CircuitBreakerRegistry::new(config, sink.clone()), sink)
    }

    #[test]
    fn opens_at_threshold_and_rejects() {
        let (reg, sink) = registry(3, 60);

        for _ in 0..2 {
            assert!(reg.check("render_api").is_ok());
            reg.record_failure("render_api");
        }
        assert_eq!(reg.state("render_api"), CircuitState::Closed);

        reg.record_failure("render_api");
        assert_eq!(reg.state("render_api"), CircuitState::Open);

        let err = reg.check("render_api").unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn cooldown_allows_single_probe_then_success_closes() {
        let (reg, _) = registry(1, 0); // zero cooldown: open → half_open immediately

        reg.record_failure("tts");
        assert_eq!(reg.state("tts"), CircuitState::Open);

        // Cooldown of 0 has elapsed; first check becomes the probe.
        assert!(reg.check("tts").is_ok());
        assert_eq!(reg.state("tts"), CircuitState::HalfOpen);

        // Second concurrent caller is rejected while the probe is in flight.
        assert!(reg.check("tts").is_err());

        reg.record_success("tts");
        assert_eq!(reg.state("tts"), CircuitState::Closed);
        assert!(reg.check("tts").is_ok());
    }

    #[test]
    fn failed_probe_reopens() {
        let (reg, sink) = registry(1, 0);

        reg.record_failure("tts");
        assert!(reg.check("tts").is_ok()); // probe
        reg.record_failure("tts");
        assert_eq!(reg.state("tts"), CircuitState::Open);
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn success_while_open_does_not_close_the_circuit() {
        let (reg, _) = registry(1, 60);

        reg.record_failure("render_api");
        assert_eq!(reg.state("render_api"), CircuitState::Open);

        // No call was admitted; a stray success report leaves the
        // cooldown in force.
        reg.record_success("render_api");
        assert_eq!(reg.state("render_api"), CircuitState::Open);
        assert!(reg.check("render_api").is_err());
    }

    #[test]
    fn success_resets_failure_count_in_closed_state() {
        let (reg, _) = registry(2, 60);

        reg.record_failure("llm");
        reg.record_success("llm");
        reg.record_failure("llm");
        // Count was reset; one failure is below the threshold of two.
        assert_eq!(reg.state("llm"), CircuitState::Closed);
    }

    #[test]
    fn breakers_are_independent_per_dependency() {
        let (reg, _) = registry(1, 60);

        reg.record_failure("render_api");
        assert_eq!(reg.state("render_api"), CircuitState::Open);
        assert_eq!(reg.state("tts"), CircuitState::Closed);
        assert!(reg.check("tts").is_ok());
    }
}
