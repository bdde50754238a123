//! palisade - Job resilience engine for multi-stage content-generation
//! pipelines.
//!
//! ## Architecture
//!
//! palisade wraps stage execution in four layers of resilience:
//! - **Checkpoints**: Durable per-job progress records, resumable after crash
//! - **Retry**: Classified failures, exponential backoff, circuit breakers
//! - **Dead letter queue**: Terminal store for jobs past their retry budget
//! - **Batch machinery**: Transactions, idempotency, progress, error triage
//!
//! ## Drivers
//!
//! - [`runner::JobRunner`]: One job, stage by stage, to completion or the DLQ
//! - [`runner::BatchRunner`]: Many jobs with bounded concurrency and
//!   exactly-once item execution
//! - [`recovery::RecoveryService`]: Startup scan that reconciles every
//!   stored checkpoint into resume / restart / dead-letter
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): Operator-configurable parameters
//! - I^B (Bounded): Upstream-service uncertainties (retry, backoff, breakers)

pub mod alert;
pub mod batch;
pub mod checkpoint;
pub mod dlq;
pub mod models;
pub mod recovery;
pub mod retry;
pub mod runner;
pub mod storage;

// Re-exports for convenience
pub use alert::{AlertEvent, AlertSink, TracingAlertSink};
pub use batch::{BatchTransaction, ErrorAggregator, IdempotencyLedger, ProgressTracker};
pub use checkpoint::CheckpointStore;
pub use dlq::{DeadLetterEntry, DeadLetterQueue, ResolutionStatus};
pub use models::{EngineConfig, EngineError, FailureKind, JobCheckpoint, Result, StageStatus};
pub use recovery::{RecoveryService, RecoverySummary};
pub use retry::{CircuitBreakerRegistry, RetryStrategy};
pub use runner::{BatchRunner, JobRunner, StageExecutor, StageSpec};
pub use storage::{FileBackend, MemoryBackend, StoreBackend};
