//! ACP wire types.
//!
//! Serde models for the subset of the Agent Communication Protocol this
//! bridge speaks: the `initialize` handshake, session creation and loading,
//! prompt turns, `session/update` notifications, and permission requests.
//! Field names follow the protocol's camelCase convention; enum values are
//! snake_case on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::update::{ActionStatus, PlanEntry};

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: u16 = 1;

// ── Handshake ─────────────────────────────────────────────────────────────────

/// File-system capabilities announced to the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    /// Agent may ask the client to read files.
    pub read_text_file: bool,
    /// Agent may ask the client to write files.
    pub write_text_file: bool,
}

/// Client capabilities announced during `initialize`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// File-system access capabilities.
    pub fs: FsCapabilities,
    /// Whether the client can host terminals for the agent.
    pub terminal: bool,
}

impl ClientCapabilities {
    /// The capability set this bridge announces.
    #[must_use]
    pub fn bridge() -> Self {
        Self {
            fs: FsCapabilities {
                read_text_file: true,
                write_text_file: true,
            },
            terminal: true,
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision the agent speaks.
    pub protocol_version: u16,
    /// Capability advertisement; opaque to the bridge.
    #[serde(default)]
    pub agent_capabilities: Value,
}

/// Result of `session/new`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// Agent-issued session identifier.
    pub session_id: String,
}

// ── Prompt turns ──────────────────────────────────────────────────────────────

/// Why a prompt turn ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent finished its response.
    EndTurn,
    /// Token budget exhausted mid-turn.
    MaxTokens,
    /// The agent hit its internal request ceiling.
    MaxTurnRequests,
    /// The agent declined to continue.
    Refusal,
    /// The turn was cancelled via `session/cancel`.
    Cancelled,
}

/// Result of `session/prompt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    /// Terminal state of the turn.
    pub stop_reason: StopReason,
}

// ── Session updates ───────────────────────────────────────────────────────────

/// One block of streamed content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
    /// Any other block kind (images, resources); carried but not rendered.
    #[serde(untagged)]
    Other(Value),
}

impl ContentBlock {
    /// Text payload, if this is a text block.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Other(_) => None,
        }
    }
}

/// Tool-call fields shared by `tool_call` and `tool_call_update`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    /// Stable identifier correlating updates to one invocation.
    pub tool_call_id: String,
    /// Human-readable title; present on the initial event, optional later.
    #[serde(default)]
    pub title: Option<String>,
    /// Tool category (`read`, `edit`, `execute`, …).
    #[serde(default)]
    pub kind: Option<String>,
    /// Lifecycle state; absent means unchanged.
    #[serde(default)]
    pub status: Option<ActionStatus>,
    /// Raw output once the call completed.
    #[serde(default)]
    pub raw_output: Option<Value>,
}

/// Payload kinds of a `session/update` notification.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// User-visible response text chunk.
    AgentMessageChunk {
        /// The chunk content.
        content: ContentBlock,
    },
    /// Agent reasoning chunk.
    AgentThoughtChunk {
        /// The chunk content.
        content: ContentBlock,
    },
    /// Echo of the user's own prompt; ignored by the router.
    UserMessageChunk {
        /// The chunk content.
        content: ContentBlock,
    },
    /// A tool call was announced.
    ToolCall(ToolCallEvent),
    /// A previously announced tool call changed state.
    ToolCallUpdate(ToolCallEvent),
    /// The agent replaced its plan.
    Plan {
        /// Current plan entries.
        entries: Vec<PlanEntry>,
    },
    /// Update kinds this build does not know; skipped.
    #[serde(other)]
    Unknown,
}

/// A `session/update` notification.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    /// Agent session the update belongs to.
    pub session_id: String,
    /// The update payload.
    pub update: SessionUpdate,
}

// ── Permission requests ───────────────────────────────────────────────────────

/// One option offered by a `session/request_permission` request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier echoed back in the selection.
    pub option_id: String,
    /// Display label.
    #[serde(default)]
    pub name: String,
    /// Option kind (`allow_always`, `allow_once`, `reject_once`, …).
    pub kind: String,
}

/// Parameters of a `session/request_permission` request.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Session the request belongs to.
    #[serde(default)]
    pub session_id: String,
    /// Offered options, in agent order.
    pub options: Vec<PermissionOption>,
    /// The tool call awaiting permission; opaque to the bridge.
    #[serde(default)]
    pub tool_call: Value,
}

/// Pick the option to auto-approve: `allow_always` wins over `allow_once`
/// wins over any other `allow_*`; with no allow option at all the first
/// offered option is selected (the agent works in an isolated worktree, so
/// granting is preferred over stalling the turn).
#[must_use]
pub fn select_permission_option(options: &[PermissionOption]) -> Option<&PermissionOption> {
    options
        .iter()
        .find(|opt| opt.kind == "allow_always")
        .or_else(|| options.iter().find(|opt| opt.kind == "allow_once"))
        .or_else(|| options.iter().find(|opt| opt.kind.starts_with("allow_")))
        .or_else(|| options.first())
}
