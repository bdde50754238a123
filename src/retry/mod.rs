//! Failure classification, backoff, circuit breaking and retry decisions.

mod backoff;
mod circuit;
mod classifier;
mod strategy;

pub use backoff::BackoffPolicy;
pub use circuit::{CircuitBreakerRegistry, CircuitState};
pub use classifier::{classify, classify_parts};
pub use strategy::{RetryAttempt, RetryState, RetryStrategy};
