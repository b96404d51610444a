//! Resilience Module
//!
//! Failure-isolation primitives for broker calls.

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
