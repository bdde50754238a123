//! Batch machinery: transactions, idempotency, progress, error aggregation.

mod errors;
mod idempotency;
mod progress;
mod transaction;

pub use errors::{ErrorAggregator, ErrorEntry, ErrorReport};
pub use idempotency::{IdempotencyLedger, IdempotencyRecord};
pub use progress::{BatchProgressState, ProgressReport, ProgressTracker, ProgressUpdate};
pub use transaction::{BatchTransaction, SavepointRecord, TransactionState, TxOperation};
