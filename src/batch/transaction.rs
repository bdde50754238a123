//! Savepoint-based transactions for batch operations.
//!
//! Epistemic foundation:
//! - K_i: A batch commits atomically — all operations succeed or none do
//! - K_i: Write-ahead pattern: record intent → execute → commit
//! - B_i: Operation failure → undo applied work back past every savepoint,
//!   then abort and re-raise
//! - I^B: Crash mid-transaction → pending transaction file enables recovery

use crate::models::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One operation inside a batch transaction.
///
/// `apply` performs the side effect; `undo` reverses it when a later
/// operation aborts the batch.
pub trait TxOperation: Send {
    fn name(&self) -> &str;
    fn apply(&mut self) -> Result<serde_json::Value>;
    fn undo(&mut self) -> Result<()>;
}

/// A named savepoint plus the operations applied since it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavepointRecord {
    pub name: String,
    /// Result payload of the operation guarded by this savepoint, once applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied: Option<serde_json::Value>,
}

/// Transaction state persisted to disk for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionState {
    pub id: String,
    pub batch_id: String,
    pub savepoints: Vec<SavepointRecord>,
    pub committed: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// All-or-nothing execution of an ordered list of operations for one batch.
///
/// Before each operation a named savepoint is created and persisted; on
/// failure the coordinator rolls back applied work in reverse order and
/// aborts the whole transaction — a batch is never left half applied.
pub struct BatchTransaction {
    id: String,
    batch_id: String,
    pending_path: PathBuf,
    savepoints: Vec<SavepointRecord>,
    finished: bool,
}

impl BatchTransaction {
    /// Begin a new transaction, creating the pending file used for recovery.
    pub fn begin(transaction_dir: &Path, batch_id: &str) -> Result<Self> {
        fs::create_dir_all(transaction_dir)
            .map_err(|e| EngineError::io("creating transaction dir", e))?;

        let id = format!("tx_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f"));
        let pending_path = transaction_dir.join(format!("{id}.pending.json"));

        let tx = Self {
            id: id.clone(),
            batch_id: batch_id.to_string(),
            pending_path,
            savepoints: Vec::new(),
            finished: false,
        };
        tx.persist_state(false)?;

        debug!(tx_id = %id, batch_id = %batch_id, "Transaction started");
        Ok(tx)
    }

    /// Execute the operations under this transaction.
    ///
    /// On success every operation's payload is committed together. On the
    /// first failure, applied operations are undone in reverse order, the
    /// transaction is aborted, and the original error is re-raised.
    pub fn execute(
        mut self,
        mut operations: Vec<Box<dyn TxOperation>>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut applied: Vec<usize> = Vec::new();

        for (idx, op) in operations.iter_mut().enumerate() {
            self.savepoint(op.name())?;

            match op.apply() {
                Ok(payload) => {
                    self.record_applied(payload)?;
                    applied.push(idx);
                }
                Err(e) => {
                    warn!(
                        tx_id = %self.id,
                        batch_id = %self.batch_id,
                        operation = op.name(),
                        error = %e,
                        "Operation failed, rolling back batch"
                    );
                    // Roll back to the savepoint (discard the failed op),
                    // then unwind every previously applied operation.
                    self.rollback_last_savepoint();
                    for &prior in applied.iter().rev() {
                        let prior_op = &mut operations[prior];
                        if let Err(undo_err) = prior_op.undo() {
                            warn!(
                                tx_id = %self.id,
                                operation = prior_op.name(),
                                error = %undo_err,
                                "Undo failed during rollback"
                            );
                        }
                        self.rollback_last_savepoint();
                    }
                    self.abort()?;
                    return Err(e);
                }
            }
        }

        let payloads = self
            .savepoints
            .iter()
            .filter_map(|sp| sp.applied.clone())
            .collect();
        self.commit()?;
        Ok(payloads)
    }

    /// Check for and recover any pending transactions left by a crash.
    ///
    /// Returns the uncommitted savepoint logs; committed-but-uncleaned
    /// transactions are silently swept.
    pub fn recover(transaction_dir: &Path) -> Result<Vec<TransactionState>> {
        let pattern = transaction_dir.join("tx_*.pending.json");
        let pending_files: Vec<_> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| EngineError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut recovered = Vec::new();
        for path in pending_files {
            let content = fs::read_to_string(&path)
                .map_err(|e| EngineError::io("reading pending transaction", e))?;
            let state: TransactionState = serde_json::from_str(&content)
                .map_err(|e| EngineError::ParseError(format!("Invalid transaction state: {e}")))?;

            if state.committed {
                debug!(tx_id = %state.id, "Transaction was committed, cleaning up");
            } else {
                warn!(
                    tx_id = %state.id,
                    batch_id = %state.batch_id,
                    savepoints = state.savepoints.len(),
                    "Found uncommitted transaction"
                );
                recovered.push(state);
            }

            fs::remove_file(&path)
                .map_err(|e| EngineError::io("removing pending transaction", e))?;
        }
        Ok(recovered)
    }

    /// Create a named savepoint and persist the intent.
    fn savepoint(&mut self, name: &str) -> Result<()> {
        self.savepoints.push(SavepointRecord {
            name: name.to_string(),
            applied: None,
        });
        self.persist_state(false)
    }

    /// Mark the most recent savepoint's operation as applied.
    fn record_applied(&mut self, payload: serde_json::Value) -> Result<()> {
        if let Some(last) = self.savepoints.last_mut() {
            last.applied = Some(payload);
        }
        self.persist_state(false)
    }

    /// Drop everything back to (and including) the most recent savepoint.
    fn rollback_last_savepoint(&mut self) {
        if let Some(sp) = self.savepoints.pop() {
            debug!(tx_id = %self.id, savepoint = %sp.name, "Rolled back to savepoint");
        }
    }

    fn commit(mut self) -> Result<()> {
        self.persist_state(true)?;
        self.cleanup()?;
        self.finished = true;
        info!(
            tx_id = %self.id,
            batch_id = %self.batch_id,
            operations = self.savepoints.len(),
            "Transaction committed"
        );
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.cleanup()?;
        self.finished = true;
        debug!(tx_id = %self.id, "Transaction aborted");
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        if self.pending_path.exists() {
            fs::remove_file(&self.pending_path)
                .map_err(|e| EngineError::io("removing pending transaction", e))?;
        }
        Ok(())
    }

    fn persist_state(&self, committed: bool) -> Result<()> {
        let state = TransactionState {
            id: self.id.clone(),
            batch_id: self.batch_id.clone(),
            savepoints: self.savepoints.clone(),
            committed,
            started_at: chrono::Utc::now(),
        };
        let content = serde_json::to_string_pretty(&state)
            .map_err(|e| EngineError::Internal(format!("Serializing transaction: {e}")))?;
        fs::write(&self.pending_path, content)
            .map_err(|e| EngineError::io("writing pending transaction", e))
    }
}

impl Drop for BatchTransaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                tx_id = %self.id,
                batch_id = %self.batch_id,
                "Transaction dropped without commit/abort - will be recovered on restart"
            );
        }
    }
}
