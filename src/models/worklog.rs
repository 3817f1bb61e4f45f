//! Work-log events derived from the agent's stream.

use serde::{Deserialize, Serialize};

/// A structured progress signal surfaced to the originating channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkLogEvent {
    /// The agent started a tool invocation.
    ToolStart {
        /// Tool name.
        tool: String,
        /// Short human-readable detail (path, command prefix, pattern…).
        details: String,
    },
    /// The agent emitted a thinking block.
    Thinking {
        /// First 100 characters of the thinking text.
        details: String,
    },
    /// A tool invocation finished.
    ToolEnd,
    /// A tool invocation returned an error result.
    Error,
    /// The agent is blocked on a permission decision.
    ApprovalPending {
        /// Tool awaiting permission.
        tool: String,
    },
}

impl WorkLogEvent {
    /// Render the event as a single notification line.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::ToolStart { tool, details } => {
                if details.is_empty() {
                    format!("🔧 {tool}")
                } else {
                    format!("🔧 {tool}: {details}")
                }
            }
            Self::Thinking { details } => format!("💭 {details}"),
            Self::ToolEnd => "✓ tool finished".into(),
            Self::Error => "✗ tool failed".into(),
            Self::ApprovalPending { tool } => format!("⏳ waiting for approval: {tool}"),
        }
    }
}
