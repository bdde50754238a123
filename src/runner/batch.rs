//! The batch driver: many jobs, bounded concurrency, exactly-once items.
//!
//! Epistemic foundation:
//! - K_i: Item execution is bracketed by the idempotency ledger — check
//!   before, store after — so a replayed batch never re-runs finished items
//! - K_i: One failed item never aborts its siblings; failures are collected
//!   and reported in aggregate
//! - B_i: The process may die mid-batch → leftover transactions are swept
//!   before new work starts

use crate::batch::{
    BatchTransaction, ErrorAggregator, ErrorReport, IdempotencyLedger, ProgressReport,
    ProgressTracker, ProgressUpdate, TxOperation,
};
use crate::models::{EngineConfig, Result};
use crate::retry::classify;
use crate::runner::{JobRunner, StageExecutor, StageSpec};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

/// One unit of work in a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub item_id: String,
    pub job_type: String,
    pub config: serde_json::Value,
    pub stages: Vec<StageSpec>,
}

/// Terminal state of one batch item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ItemStatus {
    Completed,
    /// Finished in a previous run; served from the idempotency ledger
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub item_index: usize,
    #[serde(flatten)]
    pub status: ItemStatus,
}

/// What a finished batch looks like.
#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub total_items: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub items: Vec<ItemOutcome>,
    pub progress: ProgressReport,
    pub errors: ErrorReport,
}

/// Drives a batch of jobs through a [`JobRunner`] with bounded concurrency.
pub struct BatchRunner {
    jobs: Arc<JobRunner>,
    progress: Arc<ProgressTracker>,
    errors: Arc<ErrorAggregator>,
    ledger: Arc<IdempotencyLedger>,
    config: EngineConfig,
}

impl BatchRunner {
    pub fn new(jobs: Arc<JobRunner>, config: EngineConfig) -> Self {
        Self {
            jobs,
            progress: Arc::new(ProgressTracker::new()),
            errors: Arc::new(ErrorAggregator::new()),
            ledger: Arc::new(IdempotencyLedger::new(&config.idempotency)),
            config,
        }
    }

    /// Run every item of a batch; one failed item never stops the rest.
    ///
    /// Items already completed in a previous run of the same batch are
    /// skipped via the idempotency ledger and count as completed progress.
    pub async fn run_batch(
        &self,
        batch_id: &str,
        items: Vec<BatchItem>,
        executor: Arc<dyn StageExecutor>,
    ) -> Result<BatchOutcome> {
        self.sweep_stale_transactions()?;

        let total = items.len();
        self.progress.start_batch(batch_id, total);
        let bar = self.make_bar(total as u64);

        let semaphore = Arc::new(Semaphore::new(self.config.batch.max_concurrent_jobs));
        let mut tasks: JoinSet<ItemOutcome> = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let batch_id = batch_id.to_string();
            let jobs = self.jobs.clone();
            let progress = self.progress.clone();
            let errors = self.errors.clone();
            let ledger = self.ledger.clone();
            let executor = executor.clone();
            let semaphore = semaphore.clone();
            let bar = bar.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return ItemOutcome {
                            item_id: item.item_id,
                            item_index: index,
                            status: ItemStatus::Failed {
                                error: "batch concurrency limiter closed".to_string(),
                            },
                        }
                    }
                };

                let outcome =
                    run_item(&batch_id, index, item, &jobs, &errors, &ledger, &*executor).await;

                let update = match &outcome.status {
                    ItemStatus::Failed { .. } => ProgressUpdate::item_failed(outcome.item_id.as_str()),
                    _ => ProgressUpdate::item_completed(outcome.item_id.as_str()),
                };
                if let Err(e) = progress.update_progress(&batch_id, update) {
                    warn!(batch_id = %batch_id, error = %e, "Progress update failed");
                }
                bar.inc(1);
                bar.set_message(outcome.item_id.clone());
                outcome
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    // A panicked item task; surface it as a failed item.
                    warn!(batch_id = %batch_id, error = %e, "Item task aborted");
                    outcomes.push(ItemOutcome {
                        item_id: format!("unknown_{}", Uuid::new_v4()),
                        item_index: usize::MAX,
                        status: ItemStatus::Failed {
                            error: format!("item task aborted: {e}"),
                        },
                    });
                }
            }
        }
        outcomes.sort_by_key(|o| o.item_index);
        bar.finish_and_clear();

        let completed = outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Completed))
            .count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o.status, ItemStatus::Skipped))
            .count();
        let failed = outcomes.len() - completed - skipped;

        let progress = self.progress.get_progress(batch_id)?;
        self.progress.finish_batch(batch_id);
        let errors = self.errors.aggregate(batch_id, total);
        self.errors.clear(batch_id);

        info!(
            batch_id = %batch_id,
            total,
            completed,
            skipped,
            failed,
            "Batch finished"
        );
        Ok(BatchOutcome {
            batch_id: batch_id.to_string(),
            total_items: total,
            completed,
            skipped,
            failed,
            items: outcomes,
            progress,
            errors,
        })
    }

    /// Run a group of side-effecting operations atomically for a batch.
    ///
    /// All succeed and commit together, or applied ones are undone and the
    /// first error is re-raised.
    pub fn execute_atomic(
        &self,
        batch_id: &str,
        operations: Vec<Box<dyn TxOperation>>,
    ) -> Result<Vec<serde_json::Value>> {
        let tx = BatchTransaction::begin(&self.config.storage.transaction_dir(), batch_id)?;
        tx.execute(operations)
    }

    /// Evict expired idempotency records.
    pub fn cleanup_idempotency(&self) -> usize {
        self.ledger.cleanup_expired()
    }

    fn sweep_stale_transactions(&self) -> Result<()> {
        let dir = self.config.storage.transaction_dir();
        if !dir.exists() {
            return Ok(());
        }
        for state in BatchTransaction::recover(&dir)? {
            warn!(
                tx_id = %state.id,
                batch_id = %state.batch_id,
                savepoints = state.savepoints.len(),
                "Swept uncommitted transaction from a previous run"
            );
        }
        Ok(())
    }

    fn make_bar(&self, total: u64) -> ProgressBar {
        if !self.config.batch.progress_bar {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        bar
    }
}

async fn run_item(
    batch_id: &str,
    index: usize,
    item: BatchItem,
    jobs: &JobRunner,
    errors: &ErrorAggregator,
    ledger: &IdempotencyLedger,
    executor: &dyn StageExecutor,
) -> ItemOutcome {
    let key = IdempotencyLedger::generate_key(batch_id, &item.item_id, "run_job", Some(&item.config));
    if ledger.check_duplicate(&key).is_some() {
        info!(batch_id = %batch_id, item_id = %item.item_id, "Item already completed, skipping");
        return ItemOutcome {
            item_id: item.item_id,
            item_index: index,
            status: ItemStatus::Skipped,
        };
    }

    let job_id = format!("{batch_id}_{}", item.item_id);
    let result = jobs
        .run_job(
            &job_id,
            &item.job_type,
            item.config.clone(),
            &item.stages,
            executor,
        )
        .await;

    match result {
        Ok(final_cp) => {
            let outputs: Vec<_> = final_cp
                .stages
                .iter()
                .map(|s| serde_json::json!({"stage": s.stage_name, "output_ref": s.output_ref}))
                .collect();
            ledger.store_result(&key, item.config, serde_json::Value::Array(outputs));
            ItemOutcome {
                item_id: item.item_id,
                item_index: index,
                status: ItemStatus::Completed,
            }
        }
        Err(e) => {
            errors.record_classified(batch_id, &item.item_id, index, classify(&e), &e.to_string());
            ItemOutcome {
                item_id: item.item_id,
                item_index: index,
                status: ItemStatus::Failed {
                    error: e.to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::CollectingAlertSink;
    use crate::checkpoint::CheckpointStore;
    use crate::dlq::DeadLetterQueue;
    use crate::models::{EngineError, FailureKind};
    use crate::retry::CircuitBreakerRegistry;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn batch_runner(data_dir: &std::path::Path) -> (BatchRunner, Arc<DeadLetterQueue>) {
        let mut config = EngineConfig::default();
        config.storage.data_dir = data_dir.to_path_buf();
        config.batch.progress_bar = false;

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
        let jobs = Arc::new(JobRunner::new(
            checkpoints,
            dead_letters.clone(),
            breakers,
            config.clone(),
        ));
        (BatchRunner::new(jobs, config), dead_letters)
    }

    /// Succeeds everywhere except items whose config carries "poison": true.
    struct SelectiveExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageExecutor for SelectiveExecutor {
        async fn execute(
            &self,
            stage_name: &str,
            _input_ref: Option<&str>,
            config: &serde_json::Value,
        ) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if config["poison"] == serde_json::json!(true) {
                return Err(EngineError::stage(
                    stage_name,
                    FailureKind::InvalidInput,
                    "schema validation failed",
                ));
            }
            Ok(Some(format!("ref://out/{stage_name}")))
        }
    }

    fn items(n: usize, poisoned: &[usize]) -> Vec<BatchItem> {
        (0..n)
            .map(|i| BatchItem {
                item_id: format!("item_{i}"),
                job_type: "video_generation".to_string(),
                config: serde_json::json!({"index": i, "poison": poisoned.contains(&i)}),
                stages: vec![StageSpec::new("render")],
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_items_do_not_stop_siblings() {
        let dir = TempDir::new().unwrap();
        let (runner, dead_letters) = batch_runner(dir.path());
        let executor = Arc::new(SelectiveExecutor {
            calls: AtomicU32::new(0),
        });

        let outcome = runner
            .run_batch("batch_1", items(4, &[2]), executor)
            .await
            .unwrap();

        assert_eq!(outcome.completed, 3);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.skipped, 0);
        assert!(matches!(
            outcome.items[2].status,
            ItemStatus::Failed { .. }
        ));

        // The failed item went through normal escalation.
        assert_eq!(dead_letters.list(None, None).unwrap().len(), 1);
        assert_eq!(outcome.errors.total_errors, 1);
        assert!((outcome.errors.error_rate - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_batch_skips_finished_items() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = batch_runner(dir.path());
        let executor = Arc::new(SelectiveExecutor {
            calls: AtomicU32::new(0),
        });

        let first = runner
            .run_batch("batch_1", items(3, &[]), executor.clone())
            .await
            .unwrap();
        assert_eq!(first.completed, 3);
        let calls_after_first = executor.calls.load(Ordering::SeqCst);

        let second = runner
            .run_batch("batch_1", items(3, &[]), executor.clone())
            .await
            .unwrap();
        assert_eq!(second.skipped, 3);
        assert_eq!(second.completed, 0);
        // No stage re-executed.
        assert_eq!(executor.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn different_batch_reruns_the_same_items() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = batch_runner(dir.path());
        let executor = Arc::new(SelectiveExecutor {
            calls: AtomicU32::new(0),
        });

        runner
            .run_batch("batch_1", items(2, &[]), executor.clone())
            .await
            .unwrap();
        let outcome = runner
            .run_batch("batch_2", items(2, &[]), executor.clone())
            .await
            .unwrap();
        // Different batch id → different idempotency keys.
        assert_eq!(outcome.completed, 2);
        assert_eq!(outcome.skipped, 0);
    }

    #[tokio::test]
    async fn execute_atomic_commits_through_transaction_dir() {
        let dir = TempDir::new().unwrap();
        let (runner, _) = batch_runner(dir.path());

        struct Bump(Arc<AtomicU32>);
        impl TxOperation for Bump {
            fn name(&self) -> &str {
                "bump"
            }
            fn apply(&mut self) -> Result<serde_json::Value> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
            fn undo(&mut self) -> Result<()> {
                self.0.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let counter = Arc::new(AtomicU32::new(0));
        let payloads = runner
            .execute_atomic(
                "batch_1",
                vec![
                    Box::new(Bump(counter.clone())),
                    Box::new(Bump(counter.clone())),
                ],
            )
            .unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
