//! # warden-runtime
//!
//! Resilience and self-healing for an LLM chat agent.
//!
//! This crate provides the async components around the deterministic model
//! in `warden-core`:
//! - [`resilience`]: per-dependency circuit breakers with call timeouts
//! - [`state`]: L1/L2 cache with per-namespace TTL, tier cache, rate limiting
//! - [`trace`]: execution traces of user requests and their tool calls
//! - [`improvement`]: error reports turned into human-approved memory changes
//! - [`store`]: the durable key-value backend everything persists to
//!
//! ## Key Guarantees
//!
//! 1. **Fail fast**: an open circuit rejects without touching the dependency
//! 2. **Degrade, don't fail**: an unavailable store never fails a cache read
//! 3. **Human in the loop**: skill memory changes only through an approved proposal
//!
//! ## Example
//!
//! ```rust,ignore
//! use warden_runtime::{TraceRequest, WardenConfig, WardenRuntime};
//!
//! let runtime = WardenRuntime::builder()
//!     .config(WardenConfig::from_yaml_file("warden.yaml")?)
//!     .build()?;
//!
//! runtime.admit("user-42").await?;
//! let search = runtime.breaker("search")?;
//! let outcome = runtime
//!     .traced(TraceRequest::new().user("user-42").skill("search"), async {
//!         warden_runtime::trace::traced_breaker_call(&search, None, "web_search", &params, || {
//!             client.search(query)
//!         })
//!         .await
//!     })
//!     .await;
//!
//! runtime.shutdown().await;
//! ```

pub mod config;
pub mod improvement;
pub mod prompts;
pub mod providers;
pub mod resilience;
pub mod runtime;
pub mod state;
pub mod store;
pub mod trace;

use std::time::Duration;

use thiserror::Error;
use warden_core::ValidationError;

pub use config::{ConfigError, WardenConfig};
pub use improvement::{ErrorReport, ImprovementError, ImprovementPipeline, ProposalQuery};
pub use providers::{LlmProvider, ProviderError};
pub use resilience::{CallError, CircuitBreaker, CircuitRegistry, CircuitState, UnknownBreaker};
pub use runtime::{WardenRuntime, WardenRuntimeBuilder};
pub use state::{RateDecision, StateError, StateManager};
pub use store::{DurableStore, JsonFileStore, MemoryStore, StoreError};
pub use trace::{TraceOutcome, TraceRequest, Tracer};

/// Errors surfaced by the runtime facade.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("circuit '{breaker}' is open (retry after {retry_after:?})")]
    CircuitOpen {
        breaker: String,
        retry_after: Duration,
    },

    #[error("call through '{breaker}' timed out after {after:?}")]
    Timeout { breaker: String, after: Duration },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Improvement(#[from] ImprovementError),

    #[error(transparent)]
    UnknownBreaker(#[from] UnknownBreaker),
}

impl RuntimeError {
    /// Text safe to show an end user. Never contains the underlying error.
    pub fn user_message(&self) -> String {
        match self {
            RuntimeError::CircuitOpen { .. } => {
                "service temporarily unavailable, retry later".to_string()
            }
            RuntimeError::Timeout { .. } => {
                "The request took too long. Please try again.".to_string()
            }
            RuntimeError::RateLimited { retry_after_secs } => format!(
                "Too many requests. Try again in {} seconds.",
                (*retry_after_secs).max(1)
            ),
            RuntimeError::Validation(_) => "That request could not be processed.".to_string(),
            RuntimeError::Improvement(ImprovementError::Unauthorized { .. }) => {
                "You are not allowed to do that.".to_string()
            }
            RuntimeError::Improvement(ImprovementError::NotFound(_)) => {
                "No such proposal.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<StateError> for RuntimeError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Validation(e) => RuntimeError::Validation(e),
            StateError::Store(e) => RuntimeError::Store(e),
        }
    }
}

impl<E: Into<RuntimeError>> From<CallError<E>> for RuntimeError {
    fn from(err: CallError<E>) -> Self {
        match err {
            CallError::Open {
                breaker,
                retry_after,
            } => RuntimeError::CircuitOpen {
                breaker,
                retry_after,
            },
            CallError::Timeout { breaker, after } => RuntimeError::Timeout { breaker, after },
            CallError::Inner(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_circuit_message() {
        let err: RuntimeError = CallError::<ProviderError>::Open {
            breaker: "llm".to_string(),
            retry_after: Duration::from_secs(12),
        }
        .into();
        assert_eq!(err.user_message(), "service temporarily unavailable, retry later");
    }

    #[test]
    fn test_rate_limited_message() {
        let err = RuntimeError::RateLimited {
            retry_after_secs: 42,
        };
        assert_eq!(err.user_message(), "Too many requests. Try again in 42 seconds.");
    }

    #[test]
    fn test_inner_errors_not_leaked() {
        let err: RuntimeError = CallError::Inner(ProviderError::Api {
            status: 500,
            message: "internal stack trace at db.rs:42".to_string(),
        })
        .into();
        assert!(matches!(err, RuntimeError::Provider(_)));
        assert!(!err.user_message().contains("db.rs"));
    }
}
