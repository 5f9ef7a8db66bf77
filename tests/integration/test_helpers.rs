//! Shared helpers for orchestration-level integration tests: a recording
//! adapter, a temp-dir workspace provider, a mock agent launcher, and a
//! harness that assembles a full session manager around them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Mutex;

use acp_bridge::acp::spawner::{AgentLauncher, AgentTransport, SpawnSpec};
use acp_bridge::adapter::ServiceAdapter;
use acp_bridge::config::Config;
use acp_bridge::models::request::BridgeSessionRequest;
use acp_bridge::models::update::BridgeUpdate;
use acp_bridge::orchestrator::SessionManager;
use acp_bridge::persistence::SessionStore;
use acp_bridge::repo::provider::{RepositoryHandle, WorkspaceProvider};
use acp_bridge::repo::token::{StaticTokenVendor, TokenVendor};
use acp_bridge::{AppError, Result};

use super::mock_agent::{launch_mock_agent, MockAgentScript, MockAgentState};

// ── Recording adapter ─────────────────────────────────────────────────────────

/// One observed adapter call.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Update(BridgeUpdate),
    Completion(String),
    Error(String),
}

/// Adapter double that records every call for assertions.
pub struct RecordingAdapter {
    name: String,
    pub events: Arc<Mutex<Vec<(String, AdapterEvent)>>>,
}

impl RecordingAdapter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub async fn events_for(&self, external_session_id: &str) -> Vec<AdapterEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == external_session_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub async fn completions(&self, external_session_id: &str) -> Vec<String> {
        self.events_for(external_session_id)
            .await
            .into_iter()
            .filter_map(|event| match event {
                AdapterEvent::Completion(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub async fn errors(&self, external_session_id: &str) -> Vec<String> {
        self.events_for(external_session_id)
            .await
            .into_iter()
            .filter_map(|event| match event {
                AdapterEvent::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Poll until the session has `count` terminal events (completions or
    /// errors), panicking after `timeout`.
    pub async fn wait_for_terminal_events(
        &self,
        external_session_id: &str,
        count: usize,
        timeout: Duration,
    ) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let terminal = self
                .events_for(external_session_id)
                .await
                .into_iter()
                .filter(|event| {
                    matches!(event, AdapterEvent::Completion(_) | AdapterEvent::Error(_))
                })
                .count();
            if terminal >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} terminal events on '{external_session_id}'"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl ServiceAdapter for RecordingAdapter {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn register_routes(self: Arc<Self>, router: Router) -> Router {
        router
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn on_session_created(&self, _event: Value) -> Result<BridgeSessionRequest> {
        Err(AppError::Adapter(
            "recording adapter has no ingress".into(),
        ))
    }

    fn send_update<'a>(
        &'a self,
        external_session_id: &'a str,
        update: &'a BridgeUpdate,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.events
                .lock()
                .await
                .push((external_session_id.to_owned(), AdapterEvent::Update(update.clone())));
            Ok(())
        })
    }

    fn send_completion<'a>(
        &'a self,
        external_session_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.events.lock().await.push((
                external_session_id.to_owned(),
                AdapterEvent::Completion(message.to_owned()),
            ));
            Ok(())
        })
    }

    fn send_error<'a>(
        &'a self,
        external_session_id: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.events.lock().await.push((
                external_session_id.to_owned(),
                AdapterEvent::Error(error.to_owned()),
            ));
            Ok(())
        })
    }
}

// ── Workspace provider double ─────────────────────────────────────────────────

/// Provider that hands out plain temp directories instead of git worktrees.
/// Session environments carry a marker token so tests can observe the
/// provisioned env reaching the agent spawn, and a distinct marker for
/// environments re-vended on respawn.
pub struct TempWorkspaceProvider {
    root: PathBuf,
    counter: AtomicU64,
}

/// Environment variable the provider doubles thread into agent spawns.
pub const TEST_TOKEN_VAR: &str = "BRIDGE_SESSION_TOKEN";

/// Marker value produced by [`WorkspaceProvider::refresh_env`] on the double.
pub const REFRESHED_TOKEN: &str = "refreshed";

impl TempWorkspaceProvider {
    pub fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            root,
            counter: AtomicU64::new(1),
        })
    }
}

fn simple_slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

impl WorkspaceProvider for TempWorkspaceProvider {
    fn provision<'a>(
        &'a self,
        _repo_id: &'a str,
        slug: &'a str,
        _tokens: &'a dyn TokenVendor,
    ) -> BoxFuture<'a, Result<RepositoryHandle>> {
        Box::pin(async move {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let slug = simple_slug(slug);
            let cwd = self.root.join(format!("{slug}-{n}"));
            tokio::fs::create_dir_all(&cwd)
                .await
                .map_err(|err| AppError::Worktree(err.to_string()))?;
            Ok(RepositoryHandle {
                cwd: cwd.canonicalize().map_err(|err| AppError::Worktree(err.to_string()))?,
                branch_name: format!("acp-agent/{slug}-{n}"),
                env: vec![(TEST_TOKEN_VAR.to_owned(), format!("provisioned-{n}"))],
            })
        })
    }

    fn refresh_env<'a>(
        &'a self,
        _tokens: &'a dyn TokenVendor,
    ) -> BoxFuture<'a, Result<Vec<(String, String)>>> {
        Box::pin(async move { Ok(vec![(TEST_TOKEN_VAR.to_owned(), REFRESHED_TOKEN.to_owned())]) })
    }

    fn cleanup<'a>(&'a self, cwd: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _ = tokio::fs::remove_dir_all(cwd).await;
            Ok(())
        })
    }
}

// ── Mock agent launcher ───────────────────────────────────────────────────────

/// Launcher that spawns in-process mock agents instead of subprocesses.
pub struct MockLauncher {
    script: MockAgentScript,
    pub state: Arc<Mutex<MockAgentState>>,
    pub specs: Arc<Mutex<Vec<SpawnSpec>>>,
}

impl MockLauncher {
    pub fn new(script: MockAgentScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            state: Arc::new(Mutex::new(MockAgentState::default())),
            specs: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

impl AgentLauncher for MockLauncher {
    fn launch(&self, spec: SpawnSpec) -> BoxFuture<'_, Result<AgentTransport>> {
        Box::pin(async move {
            self.state.lock().await.spawns += 1;
            self.specs.lock().await.push(spec);
            Ok(launch_mock_agent(self.script.clone(), Arc::clone(&self.state)))
        })
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

/// A fully wired session manager over test doubles.
pub struct Harness {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
    pub store: Arc<SessionStore>,
    pub state: Arc<Mutex<MockAgentState>>,
    pub specs: Arc<Mutex<Vec<SpawnSpec>>>,
    pub tmp: Arc<TempDir>,
}

/// Build a manager wired to a mock agent, a temp workspace provider, and a
/// store under a fresh temp dir.
pub fn harness(script: MockAgentScript) -> Harness {
    harness_with_vars(script, &[])
}

pub fn harness_with_vars(script: MockAgentScript, extra: &[(&str, &str)]) -> Harness {
    let tmp = Arc::new(TempDir::new().expect("tempdir"));
    harness_in(script, extra, tmp)
}

/// Build a second manager over the same state directory — a process
/// restart, as far as persistence is concerned.
pub fn restarted(previous: &Harness, script: MockAgentScript) -> Harness {
    harness_in(script, &[], Arc::clone(&previous.tmp))
}

fn harness_in(script: MockAgentScript, extra: &[(&str, &str)], tmp: Arc<TempDir>) -> Harness {
    let state_dir = tmp.path().to_string_lossy().into_owned();
    let mut vars: HashMap<String, String> = [
        ("ACP_AGENT_COMMAND", "mock-agent"),
        ("GITHUB_REPO", "acme/demo"),
        ("DEBOUNCE_WINDOW_MS", "40"),
        ("STATE_DIR", state_dir.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect();
    for (k, v) in extra {
        vars.insert((*k).to_owned(), (*v).to_owned());
    }

    let config = Arc::new(Config::from_vars(vars).expect("test config"));
    let store = Arc::new(SessionStore::new(config.sessions_path()));
    let workspaces = TempWorkspaceProvider::new(tmp.path().join("worktrees"));
    let launcher = MockLauncher::new(script);
    let state = Arc::clone(&launcher.state);
    let specs = Arc::clone(&launcher.specs);

    let manager = SessionManager::new(
        Arc::clone(&config),
        Arc::clone(&store),
        workspaces,
        Arc::new(StaticTokenVendor::new(None)),
        launcher,
    );

    Harness {
        config,
        manager,
        store,
        state,
        specs,
        tmp,
    }
}

/// A session request shaped like the S-series scenarios.
pub fn request(external_session_id: &str, service: &str, prompt: &str) -> BridgeSessionRequest {
    BridgeSessionRequest::new(
        external_session_id,
        service,
        "mock-agent",
        prompt,
        external_session_id,
    )
}
