//! Approver notifications and action tokens.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ImprovementError;

/// Callback tokens attached to a notification, one per decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTokens {
    pub approve: String,
    pub reject: String,
}

impl ActionTokens {
    pub fn for_proposal(proposal_id: &str) -> Self {
        Self {
            approve: format!("approve:{}", proposal_id),
            reject: format!("reject:{}", proposal_id),
        }
    }
}

/// Decision carried by an action token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
}

/// Split `approve:<id>` / `reject:<id>`.
pub fn parse_action_token(token: &str) -> Result<(Action, &str), ImprovementError> {
    let invalid = || ImprovementError::InvalidToken(token.to_string());
    let (verb, id) = token.trim().split_once(':').ok_or_else(invalid)?;
    let action = match verb {
        "approve" => Action::Approve,
        "reject" => Action::Reject,
        _ => return Err(invalid()),
    };
    if id.is_empty() {
        return Err(invalid());
    }
    Ok((action, id))
}

#[derive(Error, Debug)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers proposal summaries to approvers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        recipient_id: &str,
        summary: &str,
        actions: &ActionTokens,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Default when no transport is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        recipient_id: &str,
        summary: &str,
        actions: &ActionTokens,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = recipient_id,
            approve = %actions.approve,
            reject = %actions.reject,
            "Improvement proposal awaiting review:\n{}",
            summary
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_roundtrip() {
        let tokens = ActionTokens::for_proposal("p-1");
        assert_eq!(parse_action_token(&tokens.approve).unwrap(), (Action::Approve, "p-1"));
        assert_eq!(parse_action_token(&tokens.reject).unwrap(), (Action::Reject, "p-1"));
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["", "approve", "approve:", "delete:p-1", "p-1"] {
            assert!(
                matches!(parse_action_token(token), Err(ImprovementError::InvalidToken(_))),
                "token {:?} should be rejected",
                token
            );
        }
    }
}
