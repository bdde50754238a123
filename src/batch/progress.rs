//! Batch progress tracking with velocity, ETA and milestones.
//!
//! Epistemic foundation:
//! - K_i: The derived report is computed on read, never stored
//! - K_i: Milestones fire exactly once per batch
//! - B_i: ETA is undefined until velocity > 0 → Option

use crate::models::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

/// Mutable per-batch counters.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgressState {
    pub batch_id: String,
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    pub last_update: DateTime<Utc>,
}

/// Explicit update payload; unset fields leave the state untouched.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub completed: Option<usize>,
    pub failed: Option<usize>,
    pub current_item: Option<String>,
}

impl ProgressUpdate {
    /// One more item completed.
    pub fn item_completed(item: impl Into<String>) -> Self {
        Self {
            completed: Some(1),
            failed: None,
            current_item: Some(item.into()),
        }
    }

    /// One more item failed.
    pub fn item_failed(item: impl Into<String>) -> Self {
        Self {
            completed: None,
            failed: Some(1),
            current_item: Some(item.into()),
        }
    }
}

/// Derived snapshot, computed on read.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub batch_id: String,
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub percent: f64,
    /// Completed items per second since the batch started
    pub velocity: f64,
    /// Seconds to completion at current velocity; None until velocity > 0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub elapsed_seconds: f64,
}

/// Milestone percentages, fired in order, each at most once per batch.
const MILESTONES: [u8; 4] = [25, 50, 75, 100];

struct BatchEntry {
    state: BatchProgressState,
    fired_milestones: HashSet<u8>,
}

/// Tracks progress for many concurrent batches.
pub struct ProgressTracker {
    batches: DashMap<String, BatchEntry>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            batches: DashMap::new(),
        }
    }

    /// Register a batch before its first item runs.
    pub fn start_batch(&self, batch_id: &str, total_items: usize) {
        let now = Utc::now();
        self.batches.insert(
            batch_id.to_string(),
            BatchEntry {
                state: BatchProgressState {
                    batch_id: batch_id.to_string(),
                    total_items,
                    completed: 0,
                    failed: 0,
                    started_at: now,
                    current_item: None,
                    last_update: now,
                },
                fired_milestones: HashSet::new(),
            },
        );
        info!(batch_id = %batch_id, total = total_items, "Batch started");
    }

    /// Apply an update; returns the milestones (25/50/75/100) newly crossed.
    ///
    /// Counters only ever increase, so a milestone can never re-fire.
    pub fn update_progress(&self, batch_id: &str, update: ProgressUpdate) -> Result<Vec<u8>> {
        let mut entry = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| EngineError::JobNotFound(format!("batch {batch_id}")))?;

        if let Some(completed) = update.completed {
            entry.state.completed += completed;
        }
        if let Some(failed) = update.failed {
            entry.state.failed += failed;
        }
        if let Some(item) = update.current_item {
            entry.state.current_item = Some(item);
        }
        entry.state.last_update = Utc::now();

        let percent = percent_done(&entry.state);
        let mut crossed = Vec::new();
        for milestone in MILESTONES {
            if percent >= milestone as f64 && entry.fired_milestones.insert(milestone) {
                crossed.push(milestone);
            }
        }
        if !crossed.is_empty() {
            info!(
                batch_id = %batch_id,
                milestones = ?crossed,
                percent = format!("{percent:.0}"),
                "Batch milestone"
            );
        }
        Ok(crossed)
    }

    /// Derived progress report, computed on read.
    pub fn get_progress(&self, batch_id: &str) -> Result<ProgressReport> {
        let entry = self
            .batches
            .get(batch_id)
            .ok_or_else(|| EngineError::JobNotFound(format!("batch {batch_id}")))?;
        let state = &entry.state;

        let elapsed = (Utc::now() - state.started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        let remaining = state
            .total_items
            .saturating_sub(state.completed + state.failed);
        let velocity = if elapsed > 0.0 {
            state.completed as f64 / elapsed
        } else {
            0.0
        };
        let eta_seconds = (velocity > 0.0).then(|| remaining as f64 / velocity);

        Ok(ProgressReport {
            batch_id: state.batch_id.clone(),
            total_items: state.total_items,
            completed: state.completed,
            failed: state.failed,
            remaining,
            percent: percent_done(state),
            velocity,
            eta_seconds,
            elapsed_seconds: elapsed,
        })
    }

    /// Raw state snapshot, if the batch is known.
    pub fn state(&self, batch_id: &str) -> Option<BatchProgressState> {
        self.batches.get(batch_id).map(|e| e.state.clone())
    }

    /// Forget a finished batch.
    pub fn finish_batch(&self, batch_id: &str) {
        self.batches.remove(batch_id);
    }
}

fn percent_done(state: &BatchProgressState) -> f64 {
    if state.total_items == 0 {
        return 100.0;
    }
    ((state.completed + state.failed) as f64 / state.total_items as f64) * 100.0
}
