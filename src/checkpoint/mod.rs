//! Checkpoint persistence for resumable jobs.

mod store;

pub use store::CheckpointStore;
