//! Session-start request model produced by service adapters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request to start a new bridge session, parsed from an inbound external
/// event by the originating service adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeSessionRequest {
    /// Unique identifier per adapter × logical conversation
    /// (e.g. `"webhook:issue-41"`).
    pub external_session_id: String,
    /// Name of the adapter instance that produced this request.
    pub service_name: String,
    /// Which configured agent binary should run this session.
    pub agent_name: String,
    /// Opening user message delivered to the agent.
    pub prompt: String,
    /// Short human slug; becomes part of the working branch name.
    pub descriptive_name: String,
    /// Whether this request continues an existing conversation.
    #[serde(default)]
    pub is_followup: bool,
    /// Opaque bag the adapter may retrieve later (e.g. a callback URL or
    /// an upstream comment thread id).
    #[serde(default)]
    pub service_metadata: Value,
}

impl BridgeSessionRequest {
    /// Construct a request with empty metadata.
    #[must_use]
    pub fn new(
        external_session_id: impl Into<String>,
        service_name: impl Into<String>,
        agent_name: impl Into<String>,
        prompt: impl Into<String>,
        descriptive_name: impl Into<String>,
    ) -> Self {
        Self {
            external_session_id: external_session_id.into(),
            service_name: service_name.into(),
            agent_name: agent_name.into(),
            prompt: prompt.into(),
            descriptive_name: descriptive_name.into(),
            is_followup: false,
            service_metadata: Value::Null,
        }
    }
}
