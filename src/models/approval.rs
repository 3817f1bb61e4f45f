//! Approval decisions exchanged between the gateway and channel adapters.

use serde::{Deserialize, Serialize};

/// Operator decision for one tool invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Permit the tool call.
    Allow,
    /// Refuse the tool call.
    Deny,
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny => f.write_str("deny"),
        }
    }
}

/// Resolved outcome of an approval round-trip through a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalOutcome {
    /// The decision.
    pub decision: ApprovalDecision,
    /// Optional operator comment accompanying the decision.
    pub comment: Option<String>,
    /// Channel user id that responded, when known.
    pub responded_by: Option<String>,
}

impl ApprovalOutcome {
    /// An allow outcome without commentary.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            decision: ApprovalDecision::Allow,
            comment: None,
            responded_by: None,
        }
    }

    /// A deny outcome with the given comment.
    #[must_use]
    pub fn deny(comment: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Deny,
            comment: Some(comment.into()),
            responded_by: None,
        }
    }
}
