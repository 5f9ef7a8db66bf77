//! Session orchestration.
//!
//! The session manager wires adapters, the repository provider, ACP
//! sessions and the update router together, and owns crash recovery.

pub mod session_manager;

pub use session_manager::{ActiveSession, SessionManager};
