//! Alerting boundary.
//!
//! The engine defines the event payloads; the transport is external. The
//! default sink writes structured tracing events, which is where dead
//! letter inserts and circuit openings become operator-visible.

use crate::models::FailureKind;
use std::sync::Mutex;
use tracing::warn;

/// Structured events the engine emits at operator-visible boundaries.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    /// A job was moved to the dead letter queue
    JobDeadLettered {
        entry_id: String,
        job_id: String,
        failure_stage: String,
        failure_kind: FailureKind,
        final_error: String,
    },
    /// A dependency's circuit breaker opened
    CircuitOpened {
        dependency: String,
        failure_count: u32,
        cooldown_secs: u64,
    },
}

/// Transport-agnostic alert sink.
pub trait AlertSink: Send + Sync {
    fn emit(&self, event: AlertEvent);
}

/// Default sink: structured log lines via tracing.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, event: AlertEvent) {
        match event {
            AlertEvent::JobDeadLettered {
                entry_id,
                job_id,
                failure_stage,
                failure_kind,
                final_error,
            } => {
                warn!(
                    entry_id = %entry_id,
                    job_id = %job_id,
                    stage = %failure_stage,
                    kind = %failure_kind,
                    error = %final_error,
                    "Job moved to dead letter queue"
                );
            }
            AlertEvent::CircuitOpened {
                dependency,
                failure_count,
                cooldown_secs,
            } => {
                warn!(
                    dependency = %dependency,
                    failures = failure_count,
                    cooldown_secs = cooldown_secs,
                    "Circuit breaker opened"
                );
            }
        }
    }
}

/// Test sink that records every event.
#[derive(Debug, Default)]
pub struct CollectingAlertSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl CollectingAlertSink {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AlertSink for CollectingAlertSink {
    fn emit(&self, event: AlertEvent) {
        self.events.lock().unwrap().push(event);
    }
}
