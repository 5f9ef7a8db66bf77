//! ACP session lifecycle.
//!
//! One [`AcpSession`] owns one agent subprocess and its [`RpcClient`]:
//! it performs the `initialize` handshake, creates or resumes the agent's
//! session, issues prompt turns, and tears the process down on close.
//!
//! Every `session/update` notification observed between sending a prompt and
//! receiving its response belongs to that turn and reaches the update channel
//! in receive order (the reader task forwards them before the response can
//! resolve the pending request).

use std::time::Duration;

use serde_json::{json, Value};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::acp::client::{permission_handler, RequestHandlers, RpcClient};
use crate::acp::protocol::{
    ClientCapabilities, InitializeResult, PromptResponse, SessionCreated, SessionNotification,
    StopReason, PROTOCOL_VERSION,
};
use crate::acp::spawner::{AgentLauncher, SpawnSpec};
use crate::{AppError, Result};

/// Time allowed for the `initialize` exchange before the session fails.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for the best-effort `shutdown` request on close.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL on close.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// A live connection to one agent subprocess.
pub struct AcpSession {
    label: String,
    client: RpcClient,
    child: Mutex<Option<Child>>,
    acp_session_id: String,
    turn_lock: Mutex<()>,
}

impl AcpSession {
    /// Launch an agent, perform the handshake, and create or resume the
    /// agent-side session.
    ///
    /// With `resume_session_id` set, `session/load` replays the agent's
    /// stored history against the same working directory; otherwise
    /// `session/new` starts fresh.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] when the binary cannot be started.
    /// - [`AppError::Handshake`] on `initialize` timeout or protocol
    ///   mismatch.
    /// - [`AppError::Rpc`] when session creation itself fails.
    pub async fn start(
        launcher: &dyn AgentLauncher,
        spec: SpawnSpec,
        resume_session_id: Option<&str>,
        update_tx: mpsc::Sender<SessionNotification>,
    ) -> Result<Self> {
        let label = spec.command.clone();
        let cwd = spec.cwd.clone();

        let mut transport = launcher.launch(spec).await?;
        let child = transport.child.take();

        let mut handlers = RequestHandlers::new();
        handlers.register("session/request_permission", permission_handler(label.clone()));

        let client = RpcClient::connect(
            label.clone(),
            transport.incoming,
            transport.outgoing,
            handlers,
            update_tx,
        );

        // ── initialize ──────────────────────────────────
        let init_params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": ClientCapabilities::bridge(),
            "clientInfo": { "name": "acp-bridge", "version": env!("CARGO_PKG_VERSION") },
        });
        let init_result = tokio::time::timeout(
            INITIALIZE_TIMEOUT,
            client.request("initialize", init_params),
        )
        .await
        .map_err(|_| {
            AppError::Handshake(format!(
                "initialize timed out after {INITIALIZE_TIMEOUT:?} for '{label}'"
            ))
        })?
        .map_err(|err| AppError::Handshake(format!("initialize failed for '{label}': {err}")))?;

        let init: InitializeResult = serde_json::from_value(init_result)
            .map_err(|err| AppError::Handshake(format!("bad initialize result: {err}")))?;
        if init.protocol_version > PROTOCOL_VERSION {
            warn!(
                agent = label.as_str(),
                agent_version = init.protocol_version,
                "agent speaks a newer protocol revision; continuing"
            );
        }

        // ── session/new or session/load ─────────────────
        let cwd_str = cwd.to_string_lossy().into_owned();
        let acp_session_id = match resume_session_id {
            None => {
                let created = client
                    .request("session/new", json!({ "cwd": cwd_str, "mcpServers": [] }))
                    .await?;
                let created: SessionCreated = serde_json::from_value(created)
                    .map_err(|err| AppError::Rpc(format!("bad session/new result: {err}")))?;
                created.session_id
            }
            Some(session_id) => {
                client
                    .request(
                        "session/load",
                        json!({
                            "sessionId": session_id,
                            "cwd": cwd_str,
                            "mcpServers": [],
                        }),
                    )
                    .await?;
                session_id.to_owned()
            }
        };

        info!(
            agent = label.as_str(),
            acp_session_id = acp_session_id.as_str(),
            resumed = resume_session_id.is_some(),
            "acp session ready"
        );

        Ok(Self {
            label,
            client,
            child: Mutex::new(child),
            acp_session_id,
            turn_lock: Mutex::new(()),
        })
    }

    /// The agent-issued session identifier; immutable for the session's life.
    #[must_use]
    pub fn acp_session_id(&self) -> &str {
        &self.acp_session_id
    }

    /// Whether the underlying connection has died.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Run one prompt turn: send the text as a single content block and wait
    /// for the turn's stop reason. The internal turn lock guarantees at most
    /// one prompt is in flight per session.
    ///
    /// # Errors
    ///
    /// - [`AppError::ConnectionClosed`] when the agent dies mid-turn.
    /// - [`AppError::Rpc`] on agent-reported errors or malformed results.
    pub async fn prompt(&self, text: &str) -> Result<StopReason> {
        let _turn = self.turn_lock.lock().await;

        let params = json!({
            "sessionId": self.acp_session_id,
            "prompt": [ { "type": "text", "text": text } ],
        });
        let result = self.client.request("session/prompt", params).await?;
        let response: PromptResponse = serde_json::from_value(result)
            .map_err(|err| AppError::Rpc(format!("bad session/prompt result: {err}")))?;

        debug!(
            agent = self.label.as_str(),
            stop_reason = ?response.stop_reason,
            "prompt turn finished"
        );
        Ok(response.stop_reason)
    }

    /// Ask the agent to cancel the in-flight turn; the pending [`prompt`]
    /// call resolves with [`StopReason::Cancelled`].
    ///
    /// [`prompt`]: Self::prompt
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] when the agent is gone.
    pub async fn cancel(&self) -> Result<()> {
        self.client
            .notify("session/cancel", json!({ "sessionId": self.acp_session_id }))
            .await
    }

    /// Close the session: best-effort `shutdown` request, `exit`
    /// notification, then SIGTERM and — after [`KILL_GRACE`] — SIGKILL.
    /// Idempotent; safe to call on an already-dead session.
    pub async fn close(&self) {
        if !self.client.is_closed() {
            let shutdown =
                tokio::time::timeout(SHUTDOWN_TIMEOUT, self.client.request("shutdown", Value::Null))
                    .await;
            if shutdown.is_err() {
                debug!(agent = self.label.as_str(), "shutdown request timed out");
            }
            let _ = self.client.notify("exit", Value::Null).await;
        }
        self.client.shutdown();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            terminate_child(&self.label, &mut child).await;
        }
    }
}

/// Terminate a child process: SIGTERM, wait up to [`KILL_GRACE`], SIGKILL.
async fn terminate_child(label: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SIGTERM first so the agent can flush its own session storage.
        if let Ok(pid) = i32::try_from(pid) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            info!(agent = label, ?status, "agent process exited");
        }
        Ok(Err(err)) => {
            warn!(agent = label, %err, "error waiting for agent process");
        }
        Err(_) => {
            warn!(
                agent = label,
                grace_secs = KILL_GRACE.as_secs(),
                "agent did not exit within grace period, killing"
            );
            if let Err(err) = child.kill().await {
                warn!(agent = label, %err, "failed to kill agent process");
            }
        }
    }
}
