//! The job driver: one job, stage by stage, to completion or the DLQ.
//!
//! Epistemic foundation:
//! - K_i: The checkpoint is mutated before every suspension point — a crash
//!   at any await leaves a record the recovery scan can classify
//! - K_i: A job leaves the store in exactly one of two ways: terminal
//!   success (deleted) or dead-lettered (superseded)
//! - B_i: Stage execution may fail in any of the classified kinds → the
//!   retry strategy decides, the driver escalates

use crate::checkpoint::CheckpointStore;
use crate::dlq::DeadLetterQueue;
use crate::models::{EngineConfig, EngineError, JobCheckpoint, Result, StageStatus};
use crate::retry::{classify, CircuitBreakerRegistry, RetryStrategy};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Executes one pipeline stage against its external dependency.
///
/// Implementations do the actual work (LLM call, render, upload); the
/// driver owns checkpointing, retry and circuit breaking around them.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Run one stage. Returns an opaque reference to the produced artifact.
    async fn execute(
        &self,
        stage_name: &str,
        input_ref: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<Option<String>>;

    /// External dependency a stage calls, for circuit breaker scoping.
    ///
    /// Defaults to the stage name; override when several stages share one
    /// upstream service.
    fn dependency(&self, stage_name: &str) -> String {
        stage_name.to_string()
    }
}

/// Declaration of one stage in a job's pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub input_ref: Option<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_ref: None,
        }
    }

    pub fn with_input(name: impl Into<String>, input_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_ref: Some(input_ref.into()),
        }
    }
}

/// Drives a single job through its stages.
///
/// Per attempt: gate on the dependency's circuit breaker, execute, then
/// either complete the stage or hand the failure to the retry strategy.
/// Exhausted or non-retryable failures escalate to the dead letter queue.
pub struct JobRunner {
    checkpoints: Arc<CheckpointStore>,
    dead_letters: Arc<DeadLetterQueue>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: EngineConfig,
}

impl JobRunner {
    pub fn new(
        checkpoints: Arc<CheckpointStore>,
        dead_letters: Arc<DeadLetterQueue>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            checkpoints,
            dead_letters,
            breakers,
            config,
        }
    }

    /// Run a fresh job to completion.
    ///
    /// Creates the checkpoint, registers the stages, then drives. Returns
    /// the final checkpoint snapshot; the stored record is deleted on
    /// terminal success.
    pub async fn run_job(
        &self,
        job_id: &str,
        job_type: &str,
        config_snapshot: serde_json::Value,
        stages: &[StageSpec],
        executor: &dyn StageExecutor,
    ) -> Result<JobCheckpoint> {
        if stages.is_empty() {
            return Err(EngineError::InvalidInput(format!(
                "job '{job_id}' has no stages"
            )));
        }
        self.checkpoints.create(job_id, job_type, config_snapshot)?;
        for spec in stages {
            self.checkpoints
                .add_stage(job_id, &spec.name, spec.input_ref.clone())?;
        }
        self.drive(job_id, executor).await
    }

    /// Resume an existing job from its checkpoint.
    ///
    /// Completed stages are not re-executed; a stage left in_progress by an
    /// interrupted process is marked failed and retried from there.
    pub async fn resume(&self, job_id: &str, executor: &dyn StageExecutor) -> Result<JobCheckpoint> {
        let checkpoint = self
            .checkpoints
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        info!(
            job_id = %job_id,
            current_stage = checkpoint.current_stage.as_deref().unwrap_or("<none>"),
            "Resuming job from checkpoint"
        );
        self.drive(job_id, executor).await
    }

    async fn drive(&self, job_id: &str, executor: &dyn StageExecutor) -> Result<JobCheckpoint> {
        loop {
            let checkpoint = self
                .checkpoints
                .get(job_id)?
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;

            if !checkpoint.is_recoverable {
                return Err(EngineError::InvalidState(format!(
                    "job '{job_id}' was cancelled"
                )));
            }

            let next = checkpoint.stages.iter().find(|s| {
                matches!(
                    s.status,
                    StageStatus::Pending | StageStatus::InProgress | StageStatus::Failed
                )
            });
            let Some(stage) = next else {
                info!(
                    job_id = %job_id,
                    total_retries = checkpoint.total_retries,
                    "Job completed, removing checkpoint"
                );
                self.checkpoints.delete(job_id)?;
                return Ok(checkpoint);
            };

            let stage_name = stage.stage_name.clone();
            let input_ref = stage.input_ref.clone();
            if stage.status == StageStatus::InProgress {
                // Interrupted by a previous process death; take the failed
                // edge so the stage can legally re-enter in_progress.
                self.checkpoints
                    .fail_stage(job_id, &stage_name, "interrupted before completion")?;
            }

            self.run_stage(
                job_id,
                &stage_name,
                input_ref.as_deref(),
                &checkpoint.config_snapshot,
                executor,
            )
            .await?;
        }
    }

    async fn run_stage(
        &self,
        job_id: &str,
        stage_name: &str,
        input_ref: Option<&str>,
        config: &serde_json::Value,
        executor: &dyn StageExecutor,
    ) -> Result<()> {
        let mut strategy = RetryStrategy::new(job_id, stage_name, self.config.clone());
        let dependency = executor.dependency(stage_name);

        self.checkpoints.start_stage(job_id, stage_name)?;
        loop {
            let err = match self.breakers.check(&dependency) {
                Err(open) => open,
                Ok(()) => match executor.execute(stage_name, input_ref, config).await {
                    Ok(output_ref) => {
                        self.breakers.record_success(&dependency);
                        self.checkpoints
                            .complete_stage(job_id, stage_name, output_ref)?;
                        return Ok(());
                    }
                    Err(e) => {
                        self.breakers.record_failure(&dependency);
                        e
                    }
                },
            };

            self.checkpoints
                .fail_stage(job_id, stage_name, &err.to_string())?;
            // Decide before recording: record_attempt spends retry budget,
            // and the final failed attempt still belongs in the history.
            let will_retry = strategy.should_retry(&err);
            let attempt = strategy.record_attempt(&err);
            if !will_retry {
                return self.escalate(job_id, stage_name, &err, &strategy);
            }

            warn!(
                job_id = %job_id,
                stage = %stage_name,
                attempt = attempt.attempt_number,
                kind = %attempt.failure_kind,
                delay_secs = attempt.delay_seconds,
                "Stage failed, will retry"
            );

            // Persist the in_progress re-entry before suspending so an
            // observer (or a crash) sees the true state during the wait.
            self.checkpoints.start_stage(job_id, stage_name)?;
            strategy.wait_for_retry().await;
        }
    }

    fn escalate(
        &self,
        job_id: &str,
        stage_name: &str,
        err: &EngineError,
        strategy: &RetryStrategy,
    ) -> Result<()> {
        let kind = classify(err);
        let checkpoint = self
            .checkpoints
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;

        let entry = self.dead_letters.add(
            &checkpoint,
            stage_name,
            kind,
            &err.to_string(),
            strategy.attempts().to_vec(),
        )?;
        self.checkpoints.delete(job_id)?;

        warn!(
            job_id = %job_id,
            stage = %stage_name,
            entry_id = %entry.id,
            attempts = strategy.attempts().len(),
            "Job dead-lettered"
        );
        Err(EngineError::RetriesExhausted {
            stage: stage_name.to_string(),
            attempts: strategy.attempts().len() as u32,
            last_error: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::CollectingAlertSink;
    use crate::dlq::ResolutionStatus;
    use crate::models::FailureKind;
    use crate::storage::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        runner: JobRunner,
        checkpoints: Arc<CheckpointStore>,
        dead_letters: Arc<DeadLetterQueue>,
        breakers: Arc<CircuitBreakerRegistry>,
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default())
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let sink = Arc::new(CollectingAlertSink::default());
        let checkpoints = Arc::new(CheckpointStore::new(Arc::new(MemoryBackend::new())));
        let dead_letters = Arc::new(DeadLetterQueue::new(
            Arc::new(MemoryBackend::new()),
            sink.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.clone(),
            sink,
        ));
        Harness {
            runner: JobRunner::new(
                checkpoints.clone(),
                dead_letters.clone(),
                breakers.clone(),
                config,
            ),
            checkpoints,
            dead_letters,
            breakers,
        }
    }

    /// Fails the first `fail_first` calls with `kind`, then succeeds.
    struct FlakyExecutor {
        fail_first: u32,
        kind: FailureKind,
        calls: AtomicU32,
    }

    impl FlakyExecutor {
        fn new(fail_first: u32, kind: FailureKind) -> Self {
            Self {
                fail_first,
                kind,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StageExecutor for FlakyExecutor {
        async fn execute(
            &self,
            stage_name: &str,
            _input_ref: Option<&str>,
            _config: &serde_json::Value,
        ) -> Result<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(EngineError::stage(stage_name, self.kind, "request timed out"))
            } else {
                Ok(Some(format!("ref://out/{stage_name}")))
            }
        }

        fn dependency(&self, _stage_name: &str) -> String {
            "render_api".to_string()
        }
    }

    fn two_stages() -> Vec<StageSpec> {
        vec![
            StageSpec::with_input("script", "ref://prompt"),
            StageSpec::new("media"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover_within_budget() {
        let h = harness();
        let executor = FlakyExecutor::new(3, FailureKind::NetworkTimeout);

        let final_cp = h
            .runner
            .run_job(
                "job_1",
                "video_generation",
                serde_json::json!({"seed": 1}),
                &two_stages(),
                &executor,
            )
            .await
            .unwrap();

        // Three timeouts, then success; nothing dead-lettered.
        assert_eq!(final_cp.total_retries, 3);
        assert!(final_cp.is_complete());
        assert!(h.checkpoints.get("job_1").unwrap().is_none());
        assert!(h.dead_letters.list(None, None).unwrap().is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 5); // 4 on script + 1 on media
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter_the_job() {
        // Keep the breaker out of the way; this test is about the budget.
        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_threshold = 100;
        let h = harness_with(config);
        let executor = FlakyExecutor::new(u32::MAX, FailureKind::NetworkTimeout);

        let result = h
            .runner
            .run_job(
                "job_1",
                "video_generation",
                serde_json::json!({"seed": 1}),
                &two_stages(),
                &executor,
            )
            .await;
        assert!(matches!(result, Err(EngineError::RetriesExhausted { .. })));

        // NetworkTimeout allows 5 retries → 6 attempts total.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);

        let entries = h.dead_letters.list(None, None).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.resolution_status, ResolutionStatus::PendingReview);
        assert_eq!(entry.failure_stage, "script");
        assert_eq!(entry.failure_kind, FailureKind::NetworkTimeout);
        assert_eq!(entry.retry_attempts.len(), 6);
        assert_eq!(
            entry
                .checkpoint_snapshot
                .stage("script")
                .unwrap()
                .retry_count,
            6
        );

        // Superseded by the dead letter entry.
        assert!(h.checkpoints.get("job_1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_escalates_immediately() {
        let h = harness();
        let executor = FlakyExecutor::new(u32::MAX, FailureKind::InvalidInput);

        let result = h
            .runner
            .run_job("job_1", "t", serde_json::Value::Null, &two_stages(), &executor)
            .await;
        assert!(result.is_err());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let entries = h.dead_letters.list(None, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_kind, FailureKind::InvalidInput);
        assert_eq!(entries[0].retry_attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_blocks_execution() {
        let h = harness();
        // Trip the breaker before the job starts.
        for _ in 0..EngineConfig::default().circuit_breaker.failure_threshold {
            h.breakers.record_failure("render_api");
        }

        let executor = FlakyExecutor::new(0, FailureKind::NetworkTimeout);
        let result = h
            .runner
            .run_job("job_1", "t", serde_json::Value::Null, &two_stages(), &executor)
            .await;
        assert!(result.is_err());

        // The breaker rejected every attempt; the executor never ran.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        let entries = h.dead_letters.list(None, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].failure_kind, FailureKind::ResourceUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_completed_stages() {
        let h = harness();

        // A job interrupted after completing 'script', mid-'media'.
        h.checkpoints
            .create("job_1", "video_generation", serde_json::json!({"seed": 2}))
            .unwrap();
        h.checkpoints.add_stage("job_1", "script", None).unwrap();
        h.checkpoints.add_stage("job_1", "media", None).unwrap();
        h.checkpoints.start_stage("job_1", "script").unwrap();
        h.checkpoints
            .complete_stage("job_1", "script", Some("ref://script".to_string()))
            .unwrap();
        h.checkpoints.start_stage("job_1", "media").unwrap();

        let executor = FlakyExecutor::new(0, FailureKind::NetworkTimeout);
        let final_cp = h.runner.resume("job_1", &executor).await.unwrap();

        assert!(final_cp.is_complete());
        // Only 'media' re-ran.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            final_cp.stage("script").unwrap().output_ref.as_deref(),
            Some("ref://script")
        );
        // The interruption itself was recorded as one retry.
        assert_eq!(final_cp.stage("media").unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn empty_pipeline_is_rejected() {
        let h = harness();
        let executor = FlakyExecutor::new(0, FailureKind::UnknownError);
        let result = h
            .runner
            .run_job("job_1", "t", serde_json::Value::Null, &[], &executor)
            .await;
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }
}
