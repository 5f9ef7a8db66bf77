#![forbid(unsafe_code)]

//! `acp-bridge` — bridge server binary.
//!
//! Boot sequence: load configuration from the environment, open the session
//! store, build the repository provider and session manager, construct one
//! adapter per enabled service × configured agent, restore persisted
//! sessions, start adapters, and hand off to the HTTP server. Shutdown
//! closes agents gracefully while leaving persisted sessions recoverable.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_bridge::acp::spawner::ProcessLauncher;
use acp_bridge::adapter::webhook::WebhookAdapter;
use acp_bridge::adapter::ServiceAdapter;
use acp_bridge::config::Config;
use acp_bridge::http;
use acp_bridge::orchestrator::SessionManager;
use acp_bridge::persistence::SessionStore;
use acp_bridge::repo::provider::RepositoryProvider;
use acp_bridge::repo::token::vendor_from_config;
use acp_bridge::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-bridge", about = "Bridge between collaboration services and ACP agents", version, long_about = None)]
struct Cli {
    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the persistent state directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("acp-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    if let Some(state_dir) = args.state_dir {
        config.state_dir = state_dir;
    }
    let config = Arc::new(config);
    info!(
        services = ?config.enabled_services,
        agents = config.agents.len(),
        state_dir = %config.state_dir.display(),
        "configuration loaded"
    );

    // ── Core collaborators ──────────────────────────────
    let store = Arc::new(SessionStore::new(config.sessions_path()));
    let workspaces = Arc::new(RepositoryProvider::new(
        config.repos_dir(),
        config.worktrees_dir(),
        config.skills_dir.clone(),
    ));
    let tokens = vendor_from_config(&config.github);
    let manager = SessionManager::new(
        Arc::clone(&config),
        Arc::clone(&store),
        workspaces,
        tokens,
        Arc::new(ProcessLauncher),
    );

    // ── Adapters: one per enabled service × configured agent ──
    let mut adapters: Vec<Arc<dyn ServiceAdapter>> = Vec::new();
    for service in &config.enabled_services {
        match service.as_str() {
            "webhook" => {
                for agent in &config.agents {
                    adapters.push(WebhookAdapter::new(&config, agent, Arc::clone(&manager)));
                }
            }
            other => {
                return Err(AppError::Config(format!("unknown service '{other}'")));
            }
        }
    }

    // ── Restore persisted sessions, start adapters ──────
    for adapter in &adapters {
        let restored = manager
            .restore_sessions_for_adapter(Arc::clone(adapter))
            .await?;
        if restored > 0 {
            info!(
                service = adapter.service_name(),
                restored, "sessions restored from store"
            );
        }
    }
    futures_util::future::try_join_all(adapters.iter().map(|adapter| adapter.start())).await?;
    info!(adapters = adapters.len(), "adapters started");

    // ── Serve HTTP ──────────────────────────────────────
    let ct = CancellationToken::new();
    let router = http::build_router(&adapters);
    let server = {
        let ct = ct.clone();
        let port = config.http_port;
        tokio::spawn(async move {
            if let Err(err) = http::serve(router, port, ct.clone()).await {
                error!(%err, "http server failed — initiating shutdown");
                ct.cancel();
            }
        })
    };
    info!("acp-bridge ready");

    // ── Wait for first shutdown signal ──────────────────
    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    ct.cancel();

    // A second signal force-exits.
    tokio::spawn(async {
        shutdown_signal().await;
        error!("second shutdown signal received — forcing exit");
        std::process::exit(1);
    });

    shutdown_with_timeout(&manager, &adapters, server).await;
    info!("acp-bridge shut down");
    Ok(())
}

/// Maximum time to wait for graceful shutdown before giving up.
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Close agents, adapters and the HTTP server, bounded by
/// [`SHUTDOWN_TIMEOUT`]. Persisted session records are left in place so a
/// restart can resume them.
async fn shutdown_with_timeout(
    manager: &Arc<SessionManager>,
    adapters: &[Arc<dyn ServiceAdapter>],
    server: tokio::task::JoinHandle<()>,
) {
    let shutdown_fut = async {
        manager.shutdown().await;
        for adapter in adapters {
            if let Err(err) = adapter.close().await {
                warn!(service = adapter.service_name(), %err, "adapter close failed");
            }
        }
        let _ = server.await;
    };

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown_fut)
        .await
        .is_err()
    {
        error!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "graceful shutdown timed out — exiting"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
