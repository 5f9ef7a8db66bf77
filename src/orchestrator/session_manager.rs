//! Session lifecycle orchestration.
//!
//! The [`SessionManager`] is the top-level coordinator: it provisions a
//! worktree, spawns the agent, wires adapter → ACP → router → adapter, and
//! persists enough metadata for a follow-up to resume the conversation even
//! after a process restart.
//!
//! Each session is driven by one task that owns its FIFO prompt queue, so
//! at most one prompt turn is ever in flight per session and follow-ups
//! that arrive mid-turn are **queued**, never rejected. Across sessions
//! everything runs in parallel; the only shared state is the session store
//! and the provider's per-repo lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::acp::protocol::StopReason;
use crate::acp::session::AcpSession;
use crate::acp::spawner::{AgentLauncher, SpawnSpec};
use crate::adapter::ServiceAdapter;
use crate::config::{AgentConfig, Config};
use crate::models::request::BridgeSessionRequest;
use crate::models::session::PersistedSession;
use crate::persistence::SessionStore;
use crate::repo::{TokenVendor, WorkspaceProvider};
use crate::router::{self, RouterControl, RouterEvent, TurnOutcome};
use crate::{AppError, Result};

/// Queued follow-ups tolerated per session before ingress back-pressures.
const TURN_QUEUE_CAPACITY: usize = 16;

/// Raw-notification and router-output channel depth.
const STREAM_CAPACITY: usize = 256;

/// A session that produced no update within this window gets a log warning.
const FIRST_UPDATE_WARN: Duration = Duration::from_secs(10);

/// Runtime half of a session: present while an agent subprocess is alive,
/// absent after a restore or an agent crash until the next turn respawns it.
struct SessionRuntime {
    acp: Arc<AcpSession>,
    router_ctrl: mpsc::Sender<RouterControl>,
    router_task: JoinHandle<()>,
    forwarder_task: JoinHandle<()>,
}

/// In-memory record of a live or restored session.
pub struct ActiveSession {
    /// External conversation identifier (unique per adapter × conversation).
    pub external_session_id: String,
    /// Owning adapter's service name.
    pub service_name: String,
    /// Registry name of the agent running this session.
    pub agent_name: String,
    /// Worktree the agent works in; exclusively owned by this session.
    pub cwd: PathBuf,
    /// Branch the worktree is checked out on.
    pub branch_name: String,
    adapter: Arc<dyn ServiceAdapter>,
    agent: AgentConfig,
    created_at: DateTime<Utc>,
    acp_session_id: Mutex<String>,
    service_metadata: Mutex<Value>,
    extra: Mutex<serde_json::Map<String, Value>>,
    // Per-session subprocess environment issued by the repository provider
    // (short-lived API tokens). Consumed by the first spawn; respawns ask
    // the provider for a fresh one. Never persisted.
    session_env: Mutex<Vec<(String, String)>>,
    runtime: Mutex<Option<SessionRuntime>>,
    turn_tx: mpsc::Sender<String>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    first_update_seen: AtomicBool,
}

impl ActiveSession {
    /// Current agent-issued session id; empty until the first start returns.
    pub async fn acp_session_id(&self) -> String {
        self.acp_session_id.lock().await.clone()
    }

    /// Current adapter metadata for the session.
    pub async fn service_metadata(&self) -> Value {
        self.service_metadata.lock().await.clone()
    }
}

/// What the session loop should do after a turn.
enum TurnDisposition {
    Continue,
    RemoveSession,
}

/// Top-level orchestrator; one per process.
pub struct SessionManager {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    workspaces: Arc<dyn WorkspaceProvider>,
    tokens: Arc<dyn TokenVendor>,
    launcher: Arc<dyn AgentLauncher>,
    sessions: Mutex<HashMap<String, Arc<ActiveSession>>>,
    // Handed to per-session driver tasks; always upgradable while the
    // process-lifetime Arc from `new` is alive.
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    /// Assemble the manager from its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: Arc<SessionStore>,
        workspaces: Arc<dyn WorkspaceProvider>,
        tokens: Arc<dyn TokenVendor>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            store,
            workspaces,
            tokens,
            launcher,
            sessions: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// A strong handle to this manager for background tasks.
    fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    /// Whether an active session exists for the external id.
    pub async fn has_session(&self, external_session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(external_session_id)
    }

    /// The adapter metadata of a session, if it exists.
    pub async fn service_metadata(&self, external_session_id: &str) -> Option<Value> {
        let active = self.sessions.lock().await.get(external_session_id).cloned();
        match active {
            Some(active) => Some(active.service_metadata().await),
            None => None,
        }
    }

    /// Start a new session for `request`; if one already exists for the
    /// external id the request is treated as a follow-up instead.
    ///
    /// # Errors
    ///
    /// Returns provisioning and configuration errors; the caller (the
    /// originating adapter) is responsible for surfacing them via its own
    /// `send_error`. Failures after this returns are reported through the
    /// adapter by the session's driver task.
    pub async fn handle_new_session(
        &self,
        adapter: Arc<dyn ServiceAdapter>,
        request: BridgeSessionRequest,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&request.external_session_id) {
            drop(sessions);
            debug!(
                external_session_id = request.external_session_id.as_str(),
                "session exists; treating request as follow-up"
            );
            return self
                .handle_followup(
                    &request.external_session_id,
                    &request.prompt,
                    Some(request.service_metadata),
                )
                .await;
        }

        let agent = self
            .config
            .agent(&request.agent_name)
            .ok_or_else(|| {
                AppError::Config(format!("unknown agent '{}'", request.agent_name))
            })?
            .clone();
        let repo_id = self
            .config
            .github
            .repo
            .clone()
            .ok_or_else(|| AppError::Config("GITHUB_REPO is not configured".into()))?;

        let slug = if request.descriptive_name.is_empty() {
            request.external_session_id.clone()
        } else {
            request.descriptive_name.clone()
        };
        let handle = self
            .workspaces
            .provision(&repo_id, &slug, self.tokens.as_ref())
            .await?;

        let (turn_tx, turn_rx) = mpsc::channel(TURN_QUEUE_CAPACITY);
        let active = Arc::new(ActiveSession {
            external_session_id: request.external_session_id.clone(),
            service_name: request.service_name.clone(),
            agent_name: agent.name.clone(),
            cwd: handle.cwd,
            branch_name: handle.branch_name,
            adapter,
            agent,
            created_at: Utc::now(),
            acp_session_id: Mutex::new(String::new()),
            service_metadata: Mutex::new(request.service_metadata),
            extra: Mutex::new(serde_json::Map::new()),
            session_env: Mutex::new(handle.env),
            runtime: Mutex::new(None),
            turn_tx,
            loop_task: Mutex::new(None),
            first_update_seen: AtomicBool::new(false),
        });

        // Persisted immediately (without an acp_session_id) so a crash
        // between provisioning and handshake still leaves a trace.
        if let Err(err) = self.persist(&active).await {
            warn!(
                external_session_id = active.external_session_id.as_str(),
                %err,
                "initial persistence failed; session continues un-persisted"
            );
        }

        self.spawn_session_loop(&active, turn_rx).await;
        self.spawn_first_update_watchdog(&active);

        if active.turn_tx.send(request.prompt).await.is_err() {
            return Err(AppError::Agent("session driver task unavailable".into()));
        }

        info!(
            external_session_id = active.external_session_id.as_str(),
            service = active.service_name.as_str(),
            agent = active.agent_name.as_str(),
            branch = active.branch_name.as_str(),
            "session created"
        );
        sessions.insert(active.external_session_id.clone(), active);
        Ok(())
    }

    /// Queue a follow-up prompt onto an existing session.
    ///
    /// A session restored after a restart has no live runtime; the driver
    /// task respawns the agent with `session/load` before issuing the turn.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NoSuchSession`] when no live or restored record
    /// exists for the id.
    pub async fn handle_followup(
        &self,
        external_session_id: &str,
        prompt: &str,
        service_metadata: Option<Value>,
    ) -> Result<()> {
        let active = self
            .sessions
            .lock()
            .await
            .get(external_session_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NoSuchSession(format!(
                    "no active or persisted session for '{external_session_id}'; \
                     start a new conversation"
                ))
            })?;

        if let Some(metadata) = service_metadata {
            if !metadata.is_null() {
                *active.service_metadata.lock().await = metadata;
                if let Err(err) = self.persist(&active).await {
                    warn!(external_session_id, %err, "metadata persistence failed");
                }
            }
        }

        active
            .turn_tx
            .send(prompt.to_owned())
            .await
            .map_err(|_| AppError::Agent("session driver task stopped".into()))?;

        debug!(external_session_id, "follow-up queued");
        Ok(())
    }

    /// Cancel the in-flight turn of a session, if any. The pending prompt
    /// resolves with `cancelled` and the adapter receives a short terminal
    /// completion; nothing else from the turn is forwarded.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NoSuchSession`] for unknown ids and connection
    /// errors when the cancel notification cannot be delivered.
    pub async fn handle_stop(&self, external_session_id: &str) -> Result<()> {
        let active = self
            .sessions
            .lock()
            .await
            .get(external_session_id)
            .cloned()
            .ok_or_else(|| {
                AppError::NoSuchSession(format!("no session for '{external_session_id}'"))
            })?;

        let runtime = active.runtime.lock().await;
        match runtime.as_ref() {
            Some(rt) => {
                info!(external_session_id, "stop requested; cancelling turn");
                rt.acp.cancel().await
            }
            None => {
                debug!(external_session_id, "stop requested but no turn is running");
                Ok(())
            }
        }
    }

    /// Remove a session: close the agent, prune the worktree (the branch is
    /// kept for review), delete the persisted record.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] when the persisted record cannot be
    /// deleted.
    pub async fn remove_session(&self, external_session_id: &str) -> Result<()> {
        let removed = self.sessions.lock().await.remove(external_session_id);

        if let Some(active) = removed {
            if let Some(handle) = active.loop_task.lock().await.take() {
                handle.abort();
            }
            let runtime = active.runtime.lock().await.take();
            if let Some(rt) = runtime {
                rt.acp.close().await;
                rt.router_task.abort();
                rt.forwarder_task.abort();
            }
            if let Err(err) = self.workspaces.cleanup(&active.cwd).await {
                warn!(external_session_id, %err, "worktree cleanup failed");
            }
            info!(external_session_id, "session removed");
        }

        self.store.remove(external_session_id).await
    }

    /// Reconstruct restored sessions for an adapter from the store, with
    /// null runtime handles; the first follow-up respawns and resumes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] when the store cannot be read.
    pub async fn restore_sessions_for_adapter(
        &self,
        adapter: Arc<dyn ServiceAdapter>,
    ) -> Result<usize> {
        let records = self.store.load_all().await?;
        let mut sessions = self.sessions.lock().await;
        let mut restored = 0;

        for (id, record) in records {
            if record.service_name != adapter.service_name()
                || !record.is_resumable()
                || sessions.contains_key(&id)
            {
                continue;
            }
            let Some(agent) = self.config.agent(&record.agent_name) else {
                warn!(
                    external_session_id = id.as_str(),
                    agent = record.agent_name.as_str(),
                    "persisted session references an unknown agent; skipping"
                );
                continue;
            };

            let (turn_tx, turn_rx) = mpsc::channel(TURN_QUEUE_CAPACITY);
            let active = Arc::new(ActiveSession {
                external_session_id: record.external_session_id.clone(),
                service_name: record.service_name,
                agent_name: record.agent_name,
                cwd: record.cwd,
                branch_name: record.branch_name,
                adapter: Arc::clone(&adapter),
                agent: agent.clone(),
                created_at: record.created_at,
                acp_session_id: Mutex::new(record.acp_session_id),
                service_metadata: Mutex::new(record.service_metadata),
                extra: Mutex::new(record.extra),
                // Tokens are never persisted; the provider re-vends on the
                // next spawn.
                session_env: Mutex::new(Vec::new()),
                runtime: Mutex::new(None),
                turn_tx,
                loop_task: Mutex::new(None),
                first_update_seen: AtomicBool::new(true),
            });

            self.spawn_session_loop(&active, turn_rx).await;
            sessions.insert(id, active);
            restored += 1;
        }

        info!(
            service = adapter.service_name(),
            restored, "session restore complete"
        );
        Ok(restored)
    }

    /// Close every live agent (best-effort) without touching persistence,
    /// so sessions are recoverable after the restart.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ActiveSession>> =
            self.sessions.lock().await.values().cloned().collect();

        for active in sessions {
            if let Some(handle) = active.loop_task.lock().await.take() {
                handle.abort();
            }
            let runtime = active.runtime.lock().await.take();
            if let Some(rt) = runtime {
                rt.acp.close().await;
                rt.router_task.abort();
                rt.forwarder_task.abort();
            }
        }
        info!("session manager shut down; persisted records retained");
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Spawn the per-session driver task that serialises prompt turns.
    async fn spawn_session_loop(
        &self,
        active: &Arc<ActiveSession>,
        mut turn_rx: mpsc::Receiver<String>,
    ) {
        let Some(manager) = self.strong() else {
            return;
        };
        let session = Arc::clone(active);
        let handle = tokio::spawn(async move {
            while let Some(prompt) = turn_rx.recv().await {
                match Self::run_turn(&manager, &session, &prompt).await {
                    TurnDisposition::Continue => {}
                    TurnDisposition::RemoveSession => {
                        let id = session.external_session_id.clone();
                        let manager = Arc::clone(&manager);
                        // Detached: remove_session aborts this very task.
                        tokio::spawn(async move {
                            if let Err(err) = manager.remove_session(&id).await {
                                warn!(external_session_id = id.as_str(), %err,
                                    "failed to remove session after fatal spawn error");
                            }
                        });
                        break;
                    }
                }
            }
        });
        *active.loop_task.lock().await = Some(handle);
    }

    /// Run one prompt turn end to end: ensure a live runtime, prompt, then
    /// route the outcome through the session's ordered update stream.
    async fn run_turn(
        manager: &Arc<Self>,
        active: &Arc<ActiveSession>,
        prompt: &str,
    ) -> TurnDisposition {
        // ── Ensure a live runtime ───────────────────────
        let mut runtime_guard = active.runtime.lock().await;
        if runtime_guard.as_ref().is_some_and(|rt| rt.acp.is_closed()) {
            debug!(
                external_session_id = active.external_session_id.as_str(),
                "agent died between turns; respawning"
            );
            if let Some(rt) = runtime_guard.take() {
                drain_runtime(rt).await;
            }
        }
        if runtime_guard.is_none() {
            match Self::spawn_runtime(manager, active).await {
                Ok(rt) => *runtime_guard = Some(rt),
                Err(err) => {
                    drop(runtime_guard);
                    error!(
                        external_session_id = active.external_session_id.as_str(),
                        %err,
                        "agent spawn failed"
                    );
                    if let Err(send_err) = active
                        .adapter
                        .send_error(&active.external_session_id, &err.to_string())
                        .await
                    {
                        warn!(%send_err, "error notification delivery failed");
                    }
                    // A session that never obtained an agent session id has
                    // nothing to resume; destroy it. Established sessions
                    // survive for a later retry.
                    return if active.acp_session_id.lock().await.is_empty() {
                        TurnDisposition::RemoveSession
                    } else {
                        TurnDisposition::Continue
                    };
                }
            }
        }
        let (acp, router_ctrl) = match runtime_guard.as_ref() {
            Some(rt) => (Arc::clone(&rt.acp), rt.router_ctrl.clone()),
            None => return TurnDisposition::Continue,
        };
        // Release the lock so a concurrent stop request can reach the
        // runtime while the turn is in flight.
        drop(runtime_guard);

        // ── Prompt ──────────────────────────────────────
        let result = acp.prompt(prompt).await;

        let (outcome, agent_lost) = match result {
            Ok(StopReason::EndTurn | StopReason::MaxTurnRequests) => {
                (TurnOutcome::Completed, false)
            }
            Ok(StopReason::Cancelled) => (TurnOutcome::Cancelled, false),
            Ok(StopReason::Refusal) => (
                TurnOutcome::Failed {
                    message: "The agent declined to continue this request.".into(),
                },
                false,
            ),
            Ok(StopReason::MaxTokens) => (
                TurnOutcome::Failed {
                    message: "The agent ran out of tokens before finishing.".into(),
                },
                false,
            ),
            Err(err) => (
                TurnOutcome::Failed {
                    message: format!("The agent connection was lost: {err}"),
                },
                true,
            ),
        };

        // ── End of turn: flush through the ordered stream ──
        let (ack_tx, ack_rx) = oneshot::channel();
        let routed = router_ctrl
            .send(RouterControl::EndTurn {
                outcome: outcome.clone(),
                ack: ack_tx,
            })
            .await;
        if routed.is_ok() {
            let _ = ack_rx.await;
        } else {
            // Router already gone (torn down concurrently); notify directly.
            Self::notify_turn_end(active, &outcome).await;
        }

        // ── Crash handling: drop the runtime so the next turn resumes ──
        if agent_lost {
            warn!(
                external_session_id = active.external_session_id.as_str(),
                "agent connection lost; session kept for resume"
            );
            let runtime = active.runtime.lock().await.take();
            if let Some(rt) = runtime {
                drain_runtime(rt).await;
            }
        }

        TurnDisposition::Continue
    }

    /// Spawn agent + router + forwarder for a session, resuming the agent's
    /// stored conversation when a session id is already known.
    async fn spawn_runtime(
        manager: &Arc<Self>,
        active: &Arc<ActiveSession>,
    ) -> Result<SessionRuntime> {
        // The provisioning handle seeds the first spawn's environment; a
        // respawn (crash, restart) consumed it already and the provider
        // re-vends so a stale token is never reused.
        let seeded = std::mem::take(&mut *active.session_env.lock().await);
        let env = if seeded.is_empty() {
            match manager
                .workspaces
                .refresh_env(manager.tokens.as_ref())
                .await
            {
                Ok(fresh) => fresh,
                Err(err) => {
                    warn!(
                        external_session_id = active.external_session_id.as_str(),
                        %err,
                        "session environment refresh failed; spawning without repo token"
                    );
                    Vec::new()
                }
            }
        } else {
            seeded
        };
        let spec = SpawnSpec {
            command: active.agent.command.clone(),
            args: active.agent.args.clone(),
            cwd: active.cwd.clone(),
            env,
        };

        let resume = {
            let id = active.acp_session_id.lock().await;
            if id.is_empty() {
                None
            } else {
                Some(id.clone())
            }
        };

        let (notif_tx, notif_rx) = mpsc::channel(STREAM_CAPACITY);
        let acp = AcpSession::start(
            manager.launcher.as_ref(),
            spec,
            resume.as_deref(),
            notif_tx,
        )
        .await?;

        if resume.is_none() {
            *active.acp_session_id.lock().await = acp.acp_session_id().to_owned();
            if let Err(err) = manager.persist(active).await {
                warn!(
                    external_session_id = active.external_session_id.as_str(),
                    %err,
                    "persisting acp session id failed"
                );
            }
        }

        let (out_tx, out_rx) = mpsc::channel(STREAM_CAPACITY);
        let router = router::spawn(
            active.external_session_id.clone(),
            notif_rx,
            out_tx,
            manager.config.debounce_window,
        );
        let forwarder = tokio::spawn(Self::run_forwarder(Arc::clone(active), out_rx));

        Ok(SessionRuntime {
            acp: Arc::new(acp),
            router_ctrl: router.control_tx,
            router_task: router.task,
            forwarder_task: forwarder,
        })
    }

    /// Deliver router events to the adapter, in order. Rendering failures
    /// are logged and dropped; they never kill the session.
    async fn run_forwarder(active: Arc<ActiveSession>, mut out_rx: mpsc::Receiver<RouterEvent>) {
        let id = active.external_session_id.clone();
        while let Some(event) = out_rx.recv().await {
            match event {
                RouterEvent::Update(update) => {
                    active.first_update_seen.store(true, Ordering::Relaxed);
                    if let Err(err) = active.adapter.send_update(&id, &update).await {
                        warn!(
                            external_session_id = id.as_str(),
                            kind = update.kind_name(),
                            %err,
                            "update delivery failed"
                        );
                    }
                }
                RouterEvent::TurnEnded { outcome, final_message } => {
                    let delivery = match &outcome {
                        TurnOutcome::Completed => {
                            let message = final_message.as_deref().unwrap_or("Done.");
                            active.adapter.send_completion(&id, message).await
                        }
                        TurnOutcome::Cancelled => {
                            active
                                .adapter
                                .send_completion(&id, "Stopped as requested.")
                                .await
                        }
                        TurnOutcome::Failed { message } => {
                            active.adapter.send_error(&id, message).await
                        }
                    };
                    if let Err(err) = delivery {
                        warn!(external_session_id = id.as_str(), %err, "completion delivery failed");
                    }
                }
            }
        }
    }

    /// Direct adapter notification used when the router is already gone.
    async fn notify_turn_end(active: &Arc<ActiveSession>, outcome: &TurnOutcome) {
        let id = &active.external_session_id;
        let delivery = match outcome {
            TurnOutcome::Completed => active.adapter.send_completion(id, "Done.").await,
            TurnOutcome::Cancelled => {
                active.adapter.send_completion(id, "Stopped as requested.").await
            }
            TurnOutcome::Failed { message } => active.adapter.send_error(id, message).await,
        };
        if let Err(err) = delivery {
            warn!(external_session_id = id.as_str(), %err, "turn-end delivery failed");
        }
    }

    /// Warn when a fresh session stays silent past the watchdog window.
    fn spawn_first_update_watchdog(&self, active: &Arc<ActiveSession>) {
        let session = Arc::clone(active);
        tokio::spawn(async move {
            tokio::time::sleep(FIRST_UPDATE_WARN).await;
            if !session.first_update_seen.load(Ordering::Relaxed) {
                warn!(
                    external_session_id = session.external_session_id.as_str(),
                    waited_secs = FIRST_UPDATE_WARN.as_secs(),
                    "session has produced no update yet"
                );
            }
        });
    }

    /// Write the session's durable projection to the store.
    async fn persist(&self, active: &Arc<ActiveSession>) -> Result<()> {
        let record = PersistedSession {
            external_session_id: active.external_session_id.clone(),
            service_name: active.service_name.clone(),
            agent_name: active.agent_name.clone(),
            acp_session_id: active.acp_session_id.lock().await.clone(),
            cwd: active.cwd.clone(),
            branch_name: active.branch_name.clone(),
            service_metadata: active.service_metadata.lock().await.clone(),
            created_at: active.created_at,
            updated_at: Utc::now(),
            extra: active.extra.lock().await.clone(),
        };
        self.store.upsert(record).await
    }
}

/// Close a dead runtime and wait for its router and forwarder to drain, so
/// a respawned runtime can never interleave deliveries with the old one.
async fn drain_runtime(rt: SessionRuntime) {
    rt.acp.close().await;
    drop(rt.router_ctrl);
    let _ = rt.router_task.await;
    let _ = rt.forwarder_task.await;
}
