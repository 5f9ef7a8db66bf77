//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed JSON-RPC traffic or a protocol-level capability mismatch.
    Rpc(String),
    /// The agent connection reached its terminal closed state.
    ConnectionClosed(String),
    /// The agent binary could not be spawned.
    Spawn(String),
    /// The ACP `initialize` exchange failed or timed out.
    Handshake(String),
    /// The agent subprocess died or misbehaved mid-session.
    Agent(String),
    /// The bare repository could not be cloned or fetched.
    Repo(String),
    /// Worktree creation or removal failed.
    Worktree(String),
    /// Credential or signature failure.
    Auth(String),
    /// Follow-up addressed to a session with no live or persisted record.
    NoSuchSession(String),
    /// Persistence read or write failure.
    Store(String),
    /// Failure inside a service adapter's own ingress/egress path.
    Adapter(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Repo(msg) => write!(f, "repo unavailable: {msg}"),
            Self::Worktree(msg) => write!(f, "worktree: {msg}"),
            Self::Auth(msg) => write!(f, "auth failed: {msg}"),
            Self::NoSuchSession(msg) => write!(f, "no such session: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::Adapter(msg) => write!(f, "adapter: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
