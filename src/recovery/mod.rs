//! Startup recovery scan.
//!
//! Epistemic foundation:
//! - K_i: Runs once at process startup, before new work is accepted
//! - K_i: Classifies only — an external job driver performs the resumption
//! - K_i: Idempotent; checkpoint order never changes the classification
//! - B_i: One corrupt job must never block recovery of all others

use crate::checkpoint::CheckpointStore;
use crate::dlq::{DeadLetterEntry, DeadLetterQueue};
use crate::models::{EngineError, FailureKind, JobCheckpoint, Result, StageStatus};
use serde::Serialize;
use tracing::{info, warn};

/// What the scan decided for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-enter the pipeline at `from_stage`
    Resumed,
    /// Replay the job from stage 0 using its config snapshot
    Restarted,
    /// Routed to the dead letter queue
    DeadLettered,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resumed => "resumed",
            Self::Restarted => "restarted",
            Self::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// Per-job outcome of the recovery scan.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryResult {
    pub job_id: String,
    pub action: RecoveryAction,
    /// Stage to re-enter, when the action is Resumed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<String>,
    pub message: String,
}

/// Aggregate counts for one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverySummary {
    pub scanned: usize,
    pub resumed: usize,
    pub restarted: usize,
    pub dead_lettered: usize,
    pub unreadable: usize,
}

/// Startup-time scanner that reconciles every stored checkpoint into
/// resume / restart / dead-letter.
pub struct RecoveryService<'a> {
    checkpoints: &'a CheckpointStore,
    dead_letters: &'a DeadLetterQueue,
}

impl<'a> RecoveryService<'a> {
    pub fn new(checkpoints: &'a CheckpointStore, dead_letters: &'a DeadLetterQueue) -> Self {
        Self {
            checkpoints,
            dead_letters,
        }
    }

    /// Scan every stored checkpoint and classify it.
    ///
    /// Jobs routed to the DLQ have their checkpoints superseded (deleted)
    /// so a second scan over the same directory reclassifies the survivors
    /// identically.
    pub fn scan(&self) -> Result<(Vec<RecoveryResult>, RecoverySummary)> {
        let mut results = Vec::new();
        let mut summary = RecoverySummary::default();

        let mut job_ids = self.checkpoints.job_ids()?;
        job_ids.sort();

        for job_id in job_ids {
            summary.scanned += 1;

            let checkpoint = match self.checkpoints.get(&job_id) {
                Ok(Some(cp)) => cp,
                Ok(None) => continue,
                Err(e) => {
                    // Unreadable record: dead-letter a stub so the failure
                    // is operator-visible, then keep scanning.
                    warn!(job_id = %job_id, error = %e, "Unreadable checkpoint");
                    summary.unreadable += 1;
                    summary.dead_lettered += 1;
                    let stub = JobCheckpoint::new(&job_id, "unknown", serde_json::Value::Null);
                    self.dead_letters.add(
                        &stub,
                        "recovery_scan",
                        FailureKind::UnknownError,
                        &format!("checkpoint unreadable: {e}"),
                        Vec::new(),
                    )?;
                    self.checkpoints.delete(&job_id)?;
                    results.push(RecoveryResult {
                        job_id,
                        action: RecoveryAction::DeadLettered,
                        from_stage: None,
                        message: format!("checkpoint unreadable: {e}"),
                    });
                    continue;
                }
            };

            let result = self.classify(&checkpoint);
            match result.action {
                RecoveryAction::Resumed => summary.resumed += 1,
                RecoveryAction::Restarted => summary.restarted += 1,
                RecoveryAction::DeadLettered => {
                    summary.dead_lettered += 1;
                    self.dead_letters.add(
                        &checkpoint,
                        result.from_stage.as_deref().unwrap_or("recovery_scan"),
                        FailureKind::UnknownError,
                        &result.message,
                        Vec::new(),
                    )?;
                    self.checkpoints.delete(&checkpoint.job_id)?;
                }
            }
            results.push(result);
        }

        info!(
            scanned = summary.scanned,
            resumed = summary.resumed,
            restarted = summary.restarted,
            dead_lettered = summary.dead_lettered,
            "Recovery scan complete"
        );
        Ok((results, summary))
    }

    /// Manually move a live job to the dead letter queue.
    ///
    /// Operator action for jobs that are stuck but not yet failed; the
    /// checkpoint is snapshotted into the entry and then superseded.
    pub fn force_dead_letter(&self, job_id: &str, reason: &str) -> Result<DeadLetterEntry> {
        let checkpoint = self
            .checkpoints
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        let stage = checkpoint
            .current_stage
            .clone()
            .unwrap_or_else(|| "manual".to_string());

        let entry = self.dead_letters.add(
            &checkpoint,
            &stage,
            FailureKind::UnknownError,
            reason,
            Vec::new(),
        )?;
        self.checkpoints.delete(job_id)?;

        info!(
            job_id = %job_id,
            entry_id = %entry.id,
            reason = %reason,
            "Job force dead-lettered by operator"
        );
        Ok(entry)
    }

    /// Pure classification of one checkpoint. Does not touch any store.
    pub fn classify(&self, checkpoint: &JobCheckpoint) -> RecoveryResult {
        let job_id = checkpoint.job_id.clone();

        // Corrupt state is never silently retried.
        let report = checkpoint.validate();
        if !report.is_valid() {
            return RecoveryResult {
                job_id,
                action: RecoveryAction::DeadLettered,
                from_stage: None,
                message: format!("invalid checkpoint: {}", report.errors.join("; ")),
            };
        }

        if !checkpoint.is_recoverable {
            return RecoveryResult {
                job_id,
                action: RecoveryAction::DeadLettered,
                from_stage: None,
                message: "job marked non-recoverable".to_string(),
            };
        }

        // A stage interrupted mid-execution is re-entered; partial output
        // is never assumed valid.
        if let Some(stage) = checkpoint
            .stages
            .iter()
            .find(|s| s.status == StageStatus::InProgress)
        {
            return RecoveryResult {
                job_id,
                action: RecoveryAction::Resumed,
                from_stage: Some(stage.stage_name.clone()),
                message: format!("stage '{}' was interrupted mid-execution", stage.stage_name),
            };
        }

        let last_completed = checkpoint
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StageStatus::Completed)
            .next_back();

        match last_completed {
            None => RecoveryResult {
                job_id,
                action: RecoveryAction::Restarted,
                from_stage: checkpoint.stages.first().map(|s| s.stage_name.clone()),
                message: "no completed work; replaying from stage 0".to_string(),
            },
            Some((idx, stage)) => {
                let next = checkpoint.stages.get(idx + 1).map(|s| s.stage_name.clone());
                RecoveryResult {
                    job_id,
                    action: RecoveryAction::Resumed,
                    from_stage: next.clone(),
                    message: match next {
                        Some(ref n) => {
                            format!("resuming after completed stage '{}' at '{n}'", stage.stage_name)
                        }
                        None => format!(
                            "all work after stage '{}' already done",
                            stage.stage_name
                        ),
                    },
                }
            }
        }
    }
}
