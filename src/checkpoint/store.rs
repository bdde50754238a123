//! The checkpoint store: system of record for "where is this job".
//!
//! Epistemic foundation:
//! - K_i: Every mutation persists synchronously before returning — the
//!   recovery scan depends on checkpoints reflecting true last-known state
//! - K_i: One driver owns one job; mutations are whole-record replace-and-persist
//! - B_i: Stored records may be corrupt → surfaced per-job, never fatal to a scan

use crate::models::{EngineError, JobCheckpoint, Result, ValidationReport};
use crate::storage::StoreBackend;
use std::sync::Arc;
use tracing::{debug, info};

/// Durable store of [`JobCheckpoint`] records over an injected backend.
///
/// Constructed once at process start and passed by reference to every
/// component that needs it.
pub struct CheckpointStore {
    backend: Arc<dyn StoreBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Create and persist a fresh checkpoint for a starting job.
    pub fn create(
        &self,
        job_id: &str,
        job_type: &str,
        config_snapshot: serde_json::Value,
    ) -> Result<JobCheckpoint> {
        if job_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("job_id is empty".to_string()));
        }
        if self.backend.get(job_id)?.is_some() {
            return Err(EngineError::InvalidState(format!(
                "checkpoint for job '{job_id}' already exists"
            )));
        }

        let checkpoint = JobCheckpoint::new(job_id, job_type, config_snapshot);
        self.persist(&checkpoint)?;
        info!(job_id = %job_id, job_type = %job_type, "Checkpoint created");
        Ok(checkpoint)
    }

    /// Append a pending stage to a job.
    pub fn add_stage(&self, job_id: &str, name: &str, input_ref: Option<String>) -> Result<()> {
        self.mutate(job_id, |cp| cp.add_stage(name, input_ref.clone()))
    }

    /// Move a stage to in_progress and persist.
    pub fn start_stage(&self, job_id: &str, name: &str) -> Result<()> {
        self.mutate(job_id, |cp| cp.start_stage(name))
    }

    /// Mark a stage completed with its output reference and persist.
    pub fn complete_stage(&self, job_id: &str, name: &str, output_ref: Option<String>) -> Result<()> {
        self.mutate(job_id, |cp| cp.complete_stage(name, output_ref.clone()))
    }

    /// Record a stage failure (bumps retry counters) and persist.
    pub fn fail_stage(&self, job_id: &str, name: &str, error: &str) -> Result<()> {
        self.mutate(job_id, |cp| cp.fail_stage(name, error))
    }

    /// Mark a stage skipped and persist.
    pub fn skip_stage(&self, job_id: &str, name: &str) -> Result<()> {
        self.mutate(job_id, |cp| cp.skip_stage(name))
    }

    /// Mark a job non-recoverable (cooperative cancellation; checked at
    /// stage boundaries and by the recovery scan).
    pub fn mark_unrecoverable(&self, job_id: &str) -> Result<()> {
        self.mutate(job_id, |cp| {
            cp.is_recoverable = false;
            Ok(())
        })
    }

    /// Fetch a job's checkpoint.
    pub fn get(&self, job_id: &str) -> Result<Option<JobCheckpoint>> {
        match self.backend.get(job_id)? {
            None => Ok(None),
            Some(value) => {
                let checkpoint = serde_json::from_value(value).map_err(|e| {
                    EngineError::ParseError(format!("Invalid checkpoint for job {job_id}: {e}"))
                })?;
                Ok(Some(checkpoint))
            }
        }
    }

    /// Delete a checkpoint. Only legitimate on terminal success or after the
    /// job has been superseded by a dead letter entry.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        self.backend.delete(job_id)?;
        debug!(job_id = %job_id, "Checkpoint deleted");
        Ok(())
    }

    /// List stored checkpoints, optionally only recoverable ones.
    ///
    /// Unparseable records are skipped here; the recovery scan handles them
    /// via [`Self::job_ids`] + per-job classification.
    pub fn list(&self, recoverable_only: bool) -> Result<Vec<JobCheckpoint>> {
        let mut checkpoints = Vec::new();
        for id in self.backend.ids()? {
            if let Ok(Some(cp)) = self.get(&id) {
                if !recoverable_only || cp.is_recoverable {
                    checkpoints.push(cp);
                }
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(checkpoints)
    }

    /// All stored job ids, including ones whose records no longer parse.
    pub fn job_ids(&self) -> Result<Vec<String>> {
        self.backend.ids()
    }

    /// Structural validation of a stored checkpoint.
    pub fn validate(&self, job_id: &str) -> Result<ValidationReport> {
        let checkpoint = self
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        Ok(checkpoint.validate())
    }

    /// Persist a checkpoint as-is (whole-record replace).
    pub fn persist(&self, checkpoint: &JobCheckpoint) -> Result<()> {
        let value = serde_json::to_value(checkpoint)
            .map_err(|e| EngineError::Internal(format!("Serializing checkpoint: {e}")))?;
        self.backend.put(&checkpoint.job_id, &value)
    }

    fn mutate<F>(&self, job_id: &str, f: F) -> Result<()>
    where
        F: Fn(&mut JobCheckpoint) -> Result<()>,
    {
        let mut checkpoint = self
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        f(&mut checkpoint)?;
        self.persist(&checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageStatus;
    use crate::storage::{FileBackend, MemoryBackend};
    use tempfile::TempDir;

    fn memory_store() -> CheckpointStore {
        CheckpointStore::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn create_then_mutate_then_get() {
        let store = memory_store();
        store
            .create("job_1", "video_generation", serde_json::json!({"seed": 7}))
            .unwrap();
        store.add_stage("job_1", "script", None).unwrap();
        store.add_stage("job_1", "media", None).unwrap();
        store.start_stage("job_1", "script").unwrap();
        store
            .complete_stage("job_1", "script", Some("ref://script".to_string()))
            .unwrap();

        let cp = store.get("job_1").unwrap().unwrap();
        assert_eq!(cp.stage("script").unwrap().status, StageStatus::Completed);
        assert_eq!(cp.current_stage.as_deref(), Some("script"));
        assert_eq!(cp.config_snapshot["seed"], serde_json::json!(7));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = memory_store();
        store.create("job_1", "t", serde_json::Value::Null).unwrap();
        assert!(store.create("job_1", "t", serde_json::Value::Null).is_err());
    }

    #[test]
    fn fail_stage_accumulates_retries() {
        let store = memory_store();
        store.create("job_1", "t", serde_json::Value::Null).unwrap();
        store.add_stage("job_1", "media", None).unwrap();
        store.start_stage("job_1", "media").unwrap();
        store.fail_stage("job_1", "media", "timeout").unwrap();
        store.start_stage("job_1", "media").unwrap();
        store.fail_stage("job_1", "media", "timeout").unwrap();

        let cp = store.get("job_1").unwrap().unwrap();
        assert_eq!(cp.total_retries, 2);
        assert_eq!(cp.stage("media").unwrap().retry_count, 2);
    }

    #[test]
    fn skip_stage_persists_skipped_status() {
        let store = memory_store();
        store.create("job_1", "t", serde_json::Value::Null).unwrap();
        store.add_stage("job_1", "script", None).unwrap();
        store.add_stage("job_1", "media", None).unwrap();
        store.skip_stage("job_1", "script").unwrap();

        let cp = store.get("job_1").unwrap().unwrap();
        assert_eq!(cp.stage("script").unwrap().status, StageStatus::Skipped);
        // Skipped counts toward completion once every stage is terminal.
        store.start_stage("job_1", "media").unwrap();
        store.complete_stage("job_1", "media", None).unwrap();
        assert!(store.get("job_1").unwrap().unwrap().is_complete());
    }

    #[test]
    fn list_filters_recoverable() {
        let store = memory_store();
        for id in ["a", "b"] {
            store.create(id, "t", serde_json::Value::Null).unwrap();
            store.add_stage(id, "s", None).unwrap();
        }
        store.mark_unrecoverable("b").unwrap();

        assert_eq!(store.list(false).unwrap().len(), 2);
        let recoverable = store.list(true).unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].job_id, "a");
    }

    #[test]
    fn state_survives_reopen_on_file_backend() {
        let dir = TempDir::new().unwrap();
        {
            let store = CheckpointStore::new(Arc::new(FileBackend::new(dir.path()).unwrap()));
            store.create("job_1", "t", serde_json::Value::Null).unwrap();
            store.add_stage("job_1", "script", None).unwrap();
            store.start_stage("job_1", "script").unwrap();
        }

        // Fresh store over the same directory, as after a process restart.
        let store = CheckpointStore::new(Arc::new(FileBackend::new(dir.path()).unwrap()));
        let cp = store.get("job_1").unwrap().unwrap();
        assert_eq!(cp.stage("script").unwrap().status, StageStatus::InProgress);
    }

    #[test]
    fn validate_reports_missing_job() {
        let store = memory_store();
        assert!(matches!(
            store.validate("nope"),
            Err(EngineError::JobNotFound(_))
        ));
    }
}
