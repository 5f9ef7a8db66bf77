//! Persisted session model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable projection of an active session, written to the session store.
///
/// Carries no live handles; everything needed to resume the conversation
/// after a process restart (`session/load` with `acp_session_id` against the
/// preserved worktree at `cwd`).
///
/// Unknown fields from older or newer writers are preserved verbatim in
/// `extra` and written back on the next update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PersistedSession {
    /// External conversation identifier; the store key.
    pub external_session_id: String,
    /// Adapter instance that owns the conversation.
    pub service_name: String,
    /// Configured agent running the session.
    pub agent_name: String,
    /// Agent-issued session identifier; empty until the first
    /// `session/new` returns, immutable afterwards.
    #[serde(default)]
    pub acp_session_id: String,
    /// Absolute path of the session's worktree.
    pub cwd: PathBuf,
    /// Working branch created for the session.
    pub branch_name: String,
    /// Opaque adapter payload.
    #[serde(default)]
    pub service_metadata: Value,
    /// Creation timestamp.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last persistence write.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Fields this build does not know about, preserved across rewrites.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PersistedSession {
    /// Construct a fresh record for a just-provisioned session. The
    /// `acp_session_id` starts empty and is filled in once the agent
    /// returns one.
    #[must_use]
    pub fn new(
        external_session_id: String,
        service_name: String,
        agent_name: String,
        cwd: PathBuf,
        branch_name: String,
        service_metadata: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            external_session_id,
            service_name,
            agent_name,
            acp_session_id: String::new(),
            cwd,
            branch_name,
            service_metadata,
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    /// Whether the agent has issued a session id yet; only such records can
    /// be resumed after a restart.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        !self.acp_session_id.is_empty()
    }
}
