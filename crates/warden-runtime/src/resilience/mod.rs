//! Resilience patterns for warden-runtime.
//!
//! This module provides:
//! - Circuit breaker per external dependency, with timeout-wrapped calls
//! - A registry sharing one breaker per dependency across call sites
//!
//! Retry with backoff lives at the call sites that need it (proposal
//! persistence uses `backon`).

mod circuit_breaker;
mod registry;

pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
};
pub use registry::{CircuitRegistry, UnknownBreaker};
