//! ACP agent process spawner.
//!
//! Spawns agent subprocesses with `kill_on_drop(true)` and piped stdio.
//! The child inherits the parent environment plus the per-session variables
//! supplied by the repository provider (short-lived API tokens); stderr is
//! drained by a background task and logged line by line so agent diagnostics
//! never interleave with the NDJSON protocol stream on stdout.
//!
//! The [`AgentLauncher`] trait is the seam between the session layer and the
//! operating system: production uses [`ProcessLauncher`], integration tests
//! drive an in-process mock agent over duplex pipes.

use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::{AppError, Result};

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory (the session's worktree).
    pub cwd: PathBuf,
    /// Extra environment variables layered over the inherited environment.
    pub env: Vec<(String, String)>,
}

/// Duplex byte streams to a launched agent, plus the child handle when the
/// agent runs as a real subprocess.
pub struct AgentTransport {
    /// Agent → bridge stream (the agent's stdout).
    pub incoming: Box<dyn AsyncRead + Send + Unpin>,
    /// Bridge → agent stream (the agent's stdin).
    pub outgoing: Box<dyn AsyncWrite + Send + Unpin>,
    /// Child process handle; `None` for in-process transports.
    pub child: Option<Child>,
}

/// Seam between the session layer and agent process creation.
pub trait AgentLauncher: Send + Sync {
    /// Launch an agent and hand back its protocol streams.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] when the agent cannot be started.
    fn launch(&self, spec: SpawnSpec) -> BoxFuture<'_, Result<AgentTransport>>;
}

/// Production launcher: spawns the configured binary as a subprocess.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl AgentLauncher for ProcessLauncher {
    fn launch(&self, spec: SpawnSpec) -> BoxFuture<'_, Result<AgentTransport>> {
        Box::pin(async move {
            let mut cmd = Command::new(&spec.command);
            cmd.args(&spec.args)
                .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .current_dir(&spec.cwd)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn().map_err(|err| {
                AppError::Spawn(format!("failed to spawn '{}': {err}", spec.command))
            })?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
            if let Some(stderr) = child.stderr.take() {
                drain_stderr(spec.command.clone(), stderr);
            }

            info!(
                command = spec.command.as_str(),
                cwd = %spec.cwd.display(),
                pid = child.id(),
                "agent process spawned"
            );

            Ok(AgentTransport {
                incoming: Box::new(stdout),
                outgoing: Box::new(stdin),
                child: Some(child),
            })
        })
    }
}

/// Drain the agent's stderr in the background, logging each line.
fn drain_stderr<R>(command: String, stderr: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(agent = command.as_str(), "agent stderr: {line}");
        }
    });
}
