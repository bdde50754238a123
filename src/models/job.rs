//! Checkpoint record types for jobs and their stages.
//!
//! Epistemic foundation:
//! - K_i: Stage status moves forward only; a completed stage never regresses
//! - K_i: total_retries is the sum of per-stage retry counts
//! - B_i: A checkpoint loaded from disk may be structurally invalid → validate()

use crate::models::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single pipeline stage within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    Pending,
    /// Currently executing (or interrupted mid-execution)
    InProgress,
    /// Finished with an output reference
    Completed,
    /// Last attempt failed; eligible for retry
    Failed,
    /// Deliberately skipped by the driver
    Skipped,
}

impl StageStatus {
    /// Whether `next` is a legal transition from this status.
    ///
    /// The only backward edge is the retry loop: in_progress → failed →
    /// in_progress. Completed is terminal.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        use StageStatus::*;
        match (self, next) {
            (Pending, InProgress) | (Pending, Skipped) => true,
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Skipped) => true,
            (Failed, InProgress) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Checkpoint for one pipeline stage of one job.
///
/// Carries opaque references to upstream/downstream artifacts, never the
/// artifacts themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCheckpoint {
    /// Unique stage identifier within the job
    pub stage_id: String,
    /// Human-readable stage name (unique within the job)
    pub stage_name: String,
    /// Current status
    pub status: StageStatus,
    /// Reference to the stage input artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_ref: Option<String>,
    /// Reference to the stage output artifact (set on completion)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    /// When execution last entered this stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When this stage completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Message from the most recent failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Failed attempts so far
    #[serde(default)]
    pub retry_count: u32,
}

impl StageCheckpoint {
    pub fn new(index: usize, name: &str, input_ref: Option<String>) -> Self {
        Self {
            stage_id: format!("stage_{index}_{name}"),
            stage_name: name.to_string(),
            status: StageStatus::Pending,
            input_ref,
            output_ref: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
        }
    }
}

/// Durable per-job record of pipeline progress.
///
/// The system of record for "where is this job". Created when a job starts,
/// mutated on every stage transition, deleted on terminal success or when
/// superseded by a dead letter entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Unique job identifier
    pub job_id: String,
    /// Pipeline type (e.g. "video_generation")
    pub job_type: String,
    /// Name of the stage the driver is currently at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Ordered stage checkpoints
    pub stages: Vec<StageCheckpoint>,
    /// Sum of all stage retry counts
    #[serde(default)]
    pub total_retries: u32,
    /// False once the job has been externally cancelled
    #[serde(default = "default_recoverable")]
    pub is_recoverable: bool,
    /// When the job started
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
    /// Immutable copy of the job's input configuration, sufficient to
    /// replay the job without re-deriving it
    #[serde(default)]
    pub config_snapshot: serde_json::Value,
    /// Free-form metadata, passed through untouched
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

fn default_recoverable() -> bool {
    true
}

impl JobCheckpoint {
    /// Create a fresh checkpoint with no stages.
    pub fn new(job_id: &str, job_type: &str, config_snapshot: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            current_stage: None,
            stages: Vec::new(),
            total_retries: 0,
            is_recoverable: true,
            created_at: now,
            updated_at: now,
            config_snapshot,
            metadata: serde_json::Value::Null,
        }
    }

    /// Append a pending stage.
    pub fn add_stage(&mut self, name: &str, input_ref: Option<String>) -> Result<()> {
        if self.stages.iter().any(|s| s.stage_name == name) {
            return Err(EngineError::InvalidState(format!(
                "stage '{name}' already exists on job {}",
                self.job_id
            )));
        }
        self.stages
            .push(StageCheckpoint::new(self.stages.len(), name, input_ref));
        self.touch();
        Ok(())
    }

    /// Move a stage to in_progress and make it the current stage.
    pub fn start_stage(&mut self, name: &str) -> Result<()> {
        let job_id = self.job_id.clone();
        let stage = self.stage_mut(name)?;
        if !stage.status.can_transition_to(StageStatus::InProgress) {
            return Err(EngineError::InvalidState(format!(
                "stage '{name}' cannot start from {} (job {job_id})",
                stage.status
            )));
        }
        stage.status = StageStatus::InProgress;
        stage.started_at = Some(Utc::now());
        self.current_stage = Some(name.to_string());
        self.touch();
        Ok(())
    }

    /// Mark a stage completed with its output reference.
    pub fn complete_stage(&mut self, name: &str, output_ref: Option<String>) -> Result<()> {
        let job_id = self.job_id.clone();
        let stage = self.stage_mut(name)?;
        if !stage.status.can_transition_to(StageStatus::Completed) {
            return Err(EngineError::InvalidState(format!(
                "stage '{name}' cannot complete from {} (job {job_id})",
                stage.status
            )));
        }
        stage.status = StageStatus::Completed;
        stage.output_ref = output_ref;
        stage.completed_at = Some(Utc::now());
        stage.error_message = None;
        self.touch();
        Ok(())
    }

    /// Record a stage failure and bump retry counters.
    pub fn fail_stage(&mut self, name: &str, error: &str) -> Result<()> {
        let job_id = self.job_id.clone();
        let stage = self.stage_mut(name)?;
        if !stage.status.can_transition_to(StageStatus::Failed) {
            return Err(EngineError::InvalidState(format!(
                "stage '{name}' cannot fail from {} (job {job_id})",
                stage.status
            )));
        }
        stage.status = StageStatus::Failed;
        stage.error_message = Some(error.to_string());
        stage.retry_count += 1;
        self.total_retries += 1;
        self.touch();
        Ok(())
    }

    /// Mark a stage skipped.
    pub fn skip_stage(&mut self, name: &str) -> Result<()> {
        let job_id = self.job_id.clone();
        let stage = self.stage_mut(name)?;
        if !stage.status.can_transition_to(StageStatus::Skipped) {
            return Err(EngineError::InvalidState(format!(
                "stage '{name}' cannot be skipped from {} (job {job_id})",
                stage.status
            )));
        }
        stage.status = StageStatus::Skipped;
        self.touch();
        Ok(())
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageCheckpoint> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    fn stage_mut(&mut self, name: &str) -> Result<&mut StageCheckpoint> {
        let job_id = self.job_id.clone();
        self.stages
            .iter_mut()
            .find(|s| s.stage_name == name)
            .ok_or(EngineError::StageNotFound {
                job_id,
                stage: name.to_string(),
            })
    }

    /// Whether every stage finished (completed or skipped).
    pub fn is_complete(&self) -> bool {
        !self.stages.is_empty()
            && self
                .stages
                .iter()
                .all(|s| matches!(s.status, StageStatus::Completed | StageStatus::Skipped))
    }

    /// Structural validation for checkpoints loaded from disk.
    ///
    /// B_i(record well-formed) → checked explicitly, never assumed.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.job_id.trim().is_empty() {
            report.error("job_id is empty");
        }
        if self.stages.is_empty() {
            report.error("checkpoint has no stages");
        }
        if let Some(current) = &self.current_stage {
            if self.stage(current).is_none() {
                report.error(format!("current_stage '{current}' names no stage"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.stage_name.as_str()) {
                report.error(format!("duplicate stage name '{}'", stage.stage_name));
            }
            if stage.status == StageStatus::Completed && stage.completed_at.is_none() {
                report.warn(format!(
                    "stage '{}' is completed but has no completed_at",
                    stage.stage_name
                ));
            }
            if stage.status == StageStatus::Completed
                && stage.started_at.is_none()
                && stage.completed_at.is_some()
            {
                report.warn(format!(
                    "stage '{}' completed without a recorded start",
                    stage.stage_name
                ));
            }
        }

        let sum: u32 = self.stages.iter().map(|s| s.retry_count).sum();
        if sum != self.total_retries {
            report.warn(format!(
                "total_retries {} does not match stage sum {sum}",
                self.total_retries
            ));
        }

        // A completed stage after a pending one means the order was violated
        // at write time; flag it rather than guessing a resume point.
        let mut saw_pending = false;
        for stage in &self.stages {
            match stage.status {
                StageStatus::Pending => saw_pending = true,
                StageStatus::Completed if saw_pending => {
                    report.error(format!(
                        "stage '{}' completed after an earlier pending stage",
                        stage.stage_name
                    ));
                }
                _ => {}
            }
        }

        report
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Outcome of structural checkpoint validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}
