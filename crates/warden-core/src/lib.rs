//! # warden-core
//!
//! Deterministic domain model for the Warden resilience core.
//!
//! This crate holds everything that can be decided without I/O:
//! - Authorization tiers and their request budgets
//! - Execution trace, span and improvement proposal records
//! - Input sanitization for recorded tool parameters
//! - Error normalization used to deduplicate improvement proposals
//! - The sliding-window counter behind per-user rate limiting
//!
//! ## Key Guarantees
//!
//! 1. **No I/O**: nothing here touches the network, disk or clock on its own
//! 2. **No async**: callers pass in the instants they want evaluated
//! 3. **Redaction first**: sensitive parameters never reach a stored span
//!
//! The async components (circuit breakers, state manager, tracer, improvement
//! pipeline) live in `warden-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use std::time::{Duration, Instant};
//! use warden_core::{SlidingWindow, Tier};
//!
//! let mut window = SlidingWindow::new(Duration::from_secs(60));
//! let now = Instant::now();
//! let decision = window.check(now, Tier::Guest.default_rate_limit());
//! assert!(decision.allowed);
//! ```

pub mod normalize;
pub mod sanitize;
pub mod types;
pub mod window;

// Re-export main types at crate root
pub use normalize::{is_near_duplicate, normalize_error, summarize_error};
pub use sanitize::{is_sensitive_key, sanitize_params, truncate, SanitizeOptions, REDACTED};
pub use types::{
    ExecutionTrace, ImprovementProposal, ProposalSource, ProposalStatus, SkillMemory, Tier,
    ToolSpan, TraceStatus,
};
pub use window::{SlidingWindow, WindowDecision};

use thiserror::Error;

/// Longest namespace, key or user id accepted by the shared-state APIs.
pub const MAX_KEY_LEN: usize = 256;

/// Malformed input rejected before it reaches shared state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} exceeds {max} bytes (got {len})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains a forbidden character")]
    ForbiddenCharacter { field: &'static str },
}

/// Validate an identifier used as part of a shared-state key.
///
/// Rejects empty values, values longer than [`MAX_KEY_LEN`] and values with
/// control characters. Namespaces additionally may not contain `/`, which is
/// the separator of durable cache keys.
pub fn validate_key(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() > MAX_KEY_LEN {
        return Err(ValidationError::TooLong {
            field,
            len: value.len(),
            max: MAX_KEY_LEN,
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::ForbiddenCharacter { field });
    }
    if field == "namespace" && value.contains('/') {
        return Err(ValidationError::ForbiddenCharacter { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_accepts_plain_ids() {
        assert!(validate_key("key", "user:42").is_ok());
        assert!(validate_key("namespace", "search_results").is_ok());
    }

    #[test]
    fn test_validate_key_rejects_empty() {
        assert_eq!(
            validate_key("user_id", ""),
            Err(ValidationError::Empty { field: "user_id" })
        );
    }

    #[test]
    fn test_validate_key_rejects_oversized() {
        let long = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            validate_key("key", &long),
            Err(ValidationError::TooLong { len, .. }) if len == MAX_KEY_LEN + 1
        ));
    }

    #[test]
    fn test_validate_key_rejects_control_chars_and_slash_namespace() {
        assert!(validate_key("key", "a\nb").is_err());
        assert!(validate_key("namespace", "a/b").is_err());
        // Slashes are fine inside keys
        assert!(validate_key("key", "a/b").is_ok());
    }
}
