//! Agent Communication Protocol (ACP) client stack.
//!
//! JSON-RPC 2.0 over an agent subprocess's stdio, newline-delimited, one
//! message per line.
//!
//! # Submodules
//!
//! - [`codec`]: [`tokio_util::codec::LinesCodec`]-based NDJSON framing with
//!   a 10 MiB per-line limit.
//! - [`protocol`]: serde models for the handshake, prompt turns,
//!   `session/update` payloads and permission requests.
//! - [`client`]: the JSON-RPC transport — request/response correlation,
//!   notification fan-out, agent-initiated request dispatch, permission
//!   auto-approval, terminal closed state.
//! - [`spawner`]: process launching behind the [`spawner::AgentLauncher`]
//!   seam, with stderr capture.
//! - [`session`]: the per-subprocess lifecycle — spawn, handshake,
//!   new/resume, prompt, cancel, close.

pub mod client;
pub mod codec;
pub mod protocol;
pub mod session;
pub mod spawner;
