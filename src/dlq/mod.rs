//! Dead letter queue: terminal store for jobs that will not be retried
//! automatically.
//!
//! Epistemic foundation:
//! - K_i: Every insert starts at pending_review and emits an alert — this is
//!   the one place failures become operator-visible by default
//! - K_i: Resolution is one-shot; a resolved entry is immutable
//! - B_i: Entries are destroyed only by explicit operator action, never by time

use crate::alert::{AlertEvent, AlertSink};
use crate::models::{EngineError, FailureKind, JobCheckpoint, Result};
use crate::retry::RetryAttempt;
use crate::storage::StoreBackend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Resolution state of a dead letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Awaiting operator triage
    PendingReview,
    /// Operator requested a manual retry; the job was handed back
    Retried,
    /// Operator dismissed the job permanently
    Dismissed,
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PendingReview => "pending_review",
            Self::Retried => "retried",
            Self::Dismissed => "dismissed",
        };
        f.write_str(s)
    }
}

/// Terminal record for a permanently failed job.
///
/// Carries everything an operator needs to triage and manually replay:
/// the original error, the full retry history, and a snapshot of the job's
/// checkpoint and configuration at the time of failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Entry id (distinct from the job id; one job can dead-letter twice
    /// if an operator retry fails again)
    pub id: String,
    pub job_id: String,
    pub job_type: String,
    /// Immutable copy of the job's input configuration
    pub config_snapshot: serde_json::Value,
    /// Copy of the job checkpoint at time of failure
    pub checkpoint_snapshot: JobCheckpoint,
    /// Stage that ultimately failed
    pub failure_stage: String,
    pub failure_kind: FailureKind,
    pub final_error: String,
    /// Full retry history for the failing stage
    #[serde(default)]
    pub retry_attempts: Vec<RetryAttempt>,
    pub created_at: DateTime<Utc>,
    pub final_failure_at: DateTime<Utc>,
    pub resolution_status: ResolutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

/// What an operator retry hands back to the caller.
///
/// The queue does not resume the job itself; the caller re-enqueues it from
/// its last checkpoint.
#[derive(Debug, Clone)]
pub struct RetryHandoff {
    pub job_id: String,
    pub checkpoint: JobCheckpoint,
    pub config_snapshot: serde_json::Value,
}

/// Counts by resolution status and failure kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_failure_kind: HashMap<String, usize>,
}

/// The dead letter queue over an injected backend.
pub struct DeadLetterQueue {
    backend: Arc<dyn StoreBackend>,
    alerts: Arc<dyn AlertSink>,
}

impl DeadLetterQueue {
    pub fn new(backend: Arc<dyn StoreBackend>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { backend, alerts }
    }

    /// Add a permanently failed job.
    ///
    /// Always enters at pending_review; emits an alert event on insert.
    pub fn add(
        &self,
        checkpoint: &JobCheckpoint,
        failure_stage: &str,
        failure_kind: FailureKind,
        final_error: &str,
        retry_attempts: Vec<RetryAttempt>,
    ) -> Result<DeadLetterEntry> {
        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: format!("dl_{}", Uuid::new_v4()),
            job_id: checkpoint.job_id.clone(),
            job_type: checkpoint.job_type.clone(),
            config_snapshot: checkpoint.config_snapshot.clone(),
            checkpoint_snapshot: checkpoint.clone(),
            failure_stage: failure_stage.to_string(),
            failure_kind,
            final_error: final_error.to_string(),
            retry_attempts,
            created_at: now,
            final_failure_at: now,
            resolution_status: ResolutionStatus::PendingReview,
            resolved_at: None,
            resolution_notes: None,
        };

        self.persist(&entry)?;
        self.alerts.emit(AlertEvent::JobDeadLettered {
            entry_id: entry.id.clone(),
            job_id: entry.job_id.clone(),
            failure_stage: entry.failure_stage.clone(),
            failure_kind,
            final_error: entry.final_error.clone(),
        });
        Ok(entry)
    }

    /// Resolve an entry as retried, handing the checkpoint back for
    /// re-enqueueing. One-shot: only valid from pending_review.
    pub fn retry(&self, entry_id: &str) -> Result<RetryHandoff> {
        let mut entry = self.require(entry_id)?;
        self.require_pending(&entry)?;

        entry.resolution_status = ResolutionStatus::Retried;
        entry.resolved_at = Some(Utc::now());
        self.persist(&entry)?;

        info!(entry_id = %entry_id, job_id = %entry.job_id, "Dead letter entry released for retry");
        Ok(RetryHandoff {
            job_id: entry.job_id,
            checkpoint: entry.checkpoint_snapshot,
            config_snapshot: entry.config_snapshot,
        })
    }

    /// Resolve an entry as dismissed, permanently. One-shot.
    pub fn dismiss(&self, entry_id: &str, notes: &str) -> Result<DeadLetterEntry> {
        let mut entry = self.require(entry_id)?;
        self.require_pending(&entry)?;

        entry.resolution_status = ResolutionStatus::Dismissed;
        entry.resolved_at = Some(Utc::now());
        entry.resolution_notes = Some(notes.to_string());
        self.persist(&entry)?;

        info!(entry_id = %entry_id, job_id = %entry.job_id, "Dead letter entry dismissed");
        Ok(entry)
    }

    /// Fetch a single entry.
    pub fn get(&self, entry_id: &str) -> Result<Option<DeadLetterEntry>> {
        match self.backend.get(entry_id)? {
            None => Ok(None),
            Some(value) => {
                let entry = serde_json::from_value(value).map_err(|e| {
                    EngineError::ParseError(format!("Invalid dead letter entry {entry_id}: {e}"))
                })?;
                Ok(Some(entry))
            }
        }
    }

    /// List entries, newest first, optionally filtered by status and capped.
    pub fn list(
        &self,
        status: Option<ResolutionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<DeadLetterEntry>> {
        let mut entries = Vec::new();
        for id in self.backend.ids()? {
            if let Some(entry) = self.get(&id)? {
                if status.map_or(true, |s| entry.resolution_status == s) {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Remove an entry permanently. Explicit operator action only.
    pub fn purge(&self, entry_id: &str) -> Result<()> {
        self.require(entry_id)?;
        self.backend.delete(entry_id)
    }

    /// Counts by resolution status and failure kind.
    pub fn stats(&self) -> Result<DeadLetterStats> {
        let mut stats = DeadLetterStats::default();
        for entry in self.list(None, None)? {
            stats.total += 1;
            *stats
                .by_status
                .entry(entry.resolution_status.to_string())
                .or_insert(0) += 1;
            *stats
                .by_failure_kind
                .entry(entry.failure_kind.to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    fn require(&self, entry_id: &str) -> Result<DeadLetterEntry> {
        self.get(entry_id)?
            .ok_or_else(|| EngineError::EntryNotFound(entry_id.to_string()))
    }

    fn require_pending(&self, entry: &DeadLetterEntry) -> Result<()> {
        if entry.resolution_status != ResolutionStatus::PendingReview {
            return Err(EngineError::InvalidState(format!(
                "entry {} already resolved as {}",
                entry.id, entry.resolution_status
            )));
        }
        Ok(())
    }

    fn persist(&self, entry: &DeadLetterEntry) -> Result<()> {
        let value = serde_json::to_value(entry)
            .map_err(|e| EngineError::Internal(format!("Serializing dead letter entry: {e}")))?;
        self.backend.put(&entry.id, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::CollectingAlertSink;
    use crate::storage::MemoryBackend;

    fn queue() -> (DeadLetterQueue, Arc<CollectingAlertSink>) {
        let sink = Arc::new(CollectingAlertSink::default());
        (
            DeadLetterQueue::new(Arc::new(MemoryBackend::new()), sink.clone()),
            sink,
        )
    }

    fn failed_job(job_id: &str) -> JobCheckpoint {
        let mut cp = JobCheckpoint::new(job_id, "video_generation", serde_json::json!({"q": 1}));
        cp.add_stage("script", None).unwrap();
        cp.add_stage("media", None).unwrap();
        cp.start_stage("script").unwrap();
        cp.complete_stage("script", None).unwrap();
        cp.start_stage("media").unwrap();
        cp.fail_stage("media", "timeout").unwrap();
        cp
    }

    #[test]
    fn add_starts_pending_and_alerts() {
        let (queue, sink) = queue();
        let entry = queue
            .add(
                &failed_job("job_1"),
                "media",
                FailureKind::NetworkTimeout,
                "request timed out",
                Vec::new(),
            )
            .unwrap();

        assert_eq!(entry.resolution_status, ResolutionStatus::PendingReview);
        assert_eq!(entry.checkpoint_snapshot.job_id, "job_1");
        assert_eq!(sink.events().len(), 1);
        assert!(matches!(
            &sink.events()[0],
            AlertEvent::JobDeadLettered { job_id, .. } if job_id == "job_1"
        ));
    }

    #[test]
    fn retry_hands_back_checkpoint_and_config() {
        let (queue, _) = queue();
        let entry = queue
            .add(
                &failed_job("job_1"),
                "media",
                FailureKind::NetworkTimeout,
                "boom",
                Vec::new(),
            )
            .unwrap();

        let handoff = queue.retry(&entry.id).unwrap();
        assert_eq!(handoff.job_id, "job_1");
        assert_eq!(handoff.config_snapshot["q"], serde_json::json!(1));
        assert_eq!(
            queue.get(&entry.id).unwrap().unwrap().resolution_status,
            ResolutionStatus::Retried
        );
    }

    #[test]
    fn resolution_is_one_shot() {
        let (queue, _) = queue();
        let entry = queue
            .add(
                &failed_job("job_1"),
                "media",
                FailureKind::UnknownError,
                "boom",
                Vec::new(),
            )
            .unwrap();

        queue.retry(&entry.id).unwrap();
        assert!(matches!(
            queue.dismiss(&entry.id, "late dismissal"),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            queue.retry(&entry.id),
            Err(EngineError::InvalidState(_))
        ));

        // And the other way round.
        let second = queue
            .add(
                &failed_job("job_2"),
                "media",
                FailureKind::UnknownError,
                "boom",
                Vec::new(),
            )
            .unwrap();
        queue.dismiss(&second.id, "not worth it").unwrap();
        assert!(queue.retry(&second.id).is_err());
    }

    #[test]
    fn list_filters_and_limits() {
        let (queue, _) = queue();
        for i in 0..3 {
            queue
                .add(
                    &failed_job(&format!("job_{i}")),
                    "media",
                    FailureKind::ApiRateLimit,
                    "429",
                    Vec::new(),
                )
                .unwrap();
        }
        let first = &queue.list(None, None).unwrap()[0].id.clone();
        queue.dismiss(first, "dup").unwrap();

        let pending = queue
            .list(Some(ResolutionStatus::PendingReview), None)
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(queue.list(None, Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn stats_count_by_status_and_kind() {
        let (queue, _) = queue();
        queue
            .add(
                &failed_job("a"),
                "media",
                FailureKind::NetworkTimeout,
                "t",
                Vec::new(),
            )
            .unwrap();
        queue
            .add(
                &failed_job("b"),
                "media",
                FailureKind::NetworkTimeout,
                "t",
                Vec::new(),
            )
            .unwrap();
        queue
            .add(
                &failed_job("c"),
                "script",
                FailureKind::InvalidInput,
                "bad",
                Vec::new(),
            )
            .unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["pending_review"], 3);
        assert_eq!(stats.by_failure_kind["network_timeout"], 2);
        assert_eq!(stats.by_failure_kind["invalid_input"], 1);
    }
}
