//! Job and batch drivers over the resilience primitives.

mod batch;
mod job;

pub use batch::{BatchItem, BatchOutcome, BatchRunner, ItemOutcome, ItemStatus};
pub use job::{JobRunner, StageExecutor, StageSpec};
