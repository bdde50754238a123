//! Core data models for palisade.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Failure kinds with retry policies

mod config;
mod error;
mod job;

pub use config::*;
pub use error::*;
pub use job::*;
