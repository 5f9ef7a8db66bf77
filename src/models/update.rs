//! User-facing update model emitted by the update router.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a tool invocation surfaced as an [`BridgeUpdate::Action`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Announced but not started.
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// State of a single plan entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlanEntryStatus {
    /// Not started.
    Pending,
    /// Being worked on.
    #[serde(alias = "in_progress")]
    InProgress,
    /// Done.
    Completed,
    /// Abandoned.
    #[serde(alias = "cancelled")]
    Canceled,
}

/// One entry of an agent-announced plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PlanEntry {
    /// Human-readable step description.
    pub content: String,
    /// Current state of the step.
    pub status: PlanEntryStatus,
}

/// Debounced, user-facing update derived from one or more raw ACP
/// `session/update` notifications.
///
/// Adapters receive these in strict arrival order per session and render
/// them on the external service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeUpdate {
    /// Coalesced agent reasoning text.
    Thought {
        /// Concatenated thought chunks.
        text: String,
    },
    /// A tool call and its (possibly superseded) state.
    Action {
        /// Agent-assigned tool call identifier.
        id: String,
        /// Human-readable title of the invocation.
        title: String,
        /// Tool category as reported by the agent (`read`, `edit`,
        /// `execute`, …).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_kind: Option<String>,
        /// Latest observed lifecycle state.
        status: ActionStatus,
        /// Raw output attached once the call reached a terminal state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    /// Replace-in-full plan snapshot.
    Plan {
        /// Current plan entries in agent order.
        entries: Vec<PlanEntry>,
    },
    /// Coalesced user-visible response text.
    MessageChunk {
        /// Concatenated message chunks.
        text: String,
    },
    /// Turn-level failure surfaced to the user.
    Error {
        /// Human-readable description.
        message: String,
    },
}

impl BridgeUpdate {
    /// Short kind label used in logs and coalescing decisions.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::Action { .. } => "action",
            Self::Plan { .. } => "plan",
            Self::MessageChunk { .. } => "message_chunk",
            Self::Error { .. } => "error",
        }
    }
}
