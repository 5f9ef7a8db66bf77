//! Global configuration parsing and validation.
//!
//! Configuration is read from the process environment once at boot and
//! handed to the application shell as an immutable [`Config`] value.
//! Recognized variables:
//!
//! | Variable | Effect |
//! |---|---|
//! | `ACP_AGENT_COMMAND` | single-agent registry with the given command line |
//! | `AGENTS_JSON` | multi-agent registry `{name: {command, args?, default?}}` |
//! | `ENABLED_SERVICES` | comma-separated adapter selection |
//! | `<VAR>__<AGENT>` | per-agent override of a credential variable |
//! | `GITHUB_*` | code-hosting integration (repo, App credentials, token) |
//! | `WEBHOOK_SECRET`, `WEBHOOK_CALLBACK_URL` | webhook adapter settings |
//! | `HTTP_PORT`, `STATE_DIR`, `DEBOUNCE_WINDOW_MS`, `SKILLS_DIR` | runtime knobs |

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Default debounce window applied by the update router.
pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;

/// One configured agent binary, selected by name per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Registry key; also the path suffix for non-default webhook routes.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed before any session-specific ones.
    pub args: Vec<String>,
    /// Whether this agent serves unqualified ingress routes.
    pub is_default: bool,
}

/// Code-hosting integration settings consumed by the repository provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GithubConfig {
    /// Logical repository in `owner/repo` form.
    pub repo: Option<String>,
    /// GitHub App id for installation-token minting.
    pub app_id: Option<String>,
    /// PEM-encoded App private key.
    pub private_key: Option<String>,
    /// Installation the App token is scoped to.
    pub installation_id: Option<String>,
    /// Webhook signature secret (consumed by code-hosting adapters).
    pub webhook_secret: Option<String>,
    /// Static personal/installation token fallback.
    pub token: Option<String>,
}

impl GithubConfig {
    /// Whether App-based token minting is fully configured.
    #[must_use]
    pub fn has_app_credentials(&self) -> bool {
        self.app_id.is_some() && self.private_key.is_some() && self.installation_id.is_some()
    }
}

/// Wire shape of one `AGENTS_JSON` registry entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct AgentEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    default: bool,
}

/// Immutable global configuration assembled from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Adapter names to instantiate.
    pub enabled_services: Vec<String>,
    /// Agent registry; exactly one entry has `is_default` set.
    pub agents: Vec<AgentConfig>,
    /// Code-hosting settings.
    pub github: GithubConfig,
    /// Shared secret expected on webhook ingress requests.
    pub webhook_secret: Option<String>,
    /// Default egress callback URL for the webhook adapter.
    pub webhook_callback_url: Option<String>,
    /// HTTP listen port.
    pub http_port: u16,
    /// Persistent volume root for the session store, bare repos and worktrees.
    pub state_dir: PathBuf,
    /// Update-router debounce window.
    pub debounce_window: Duration,
    /// Optional directory of skill files installed into each worktree.
    pub skills_dir: Option<PathBuf>,
    /// Raw variables retained for per-agent credential lookups.
    vars: HashMap<String, String>,
}

impl Config {
    /// Build configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on malformed or missing required values.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build configuration from an explicit variable map (test seam).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on malformed or missing required values.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let agents = parse_agent_registry(&vars)?;

        let enabled_services = vars
            .get("ENABLED_SERVICES")
            .map_or_else(|| vec!["webhook".to_owned()], |raw| split_csv(raw));
        if enabled_services.is_empty() {
            return Err(AppError::Config("ENABLED_SERVICES must not be empty".into()));
        }

        let http_port = match vars.get("HTTP_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|err| AppError::Config(format!("invalid HTTP_PORT '{raw}': {err}")))?,
            None => 8080,
        };

        let debounce_ms = match vars.get("DEBOUNCE_WINDOW_MS") {
            Some(raw) => raw.parse::<u64>().map_err(|err| {
                AppError::Config(format!("invalid DEBOUNCE_WINDOW_MS '{raw}': {err}"))
            })?,
            None => DEFAULT_DEBOUNCE_MS,
        };

        let github = GithubConfig {
            repo: vars.get("GITHUB_REPO").cloned(),
            app_id: vars.get("GITHUB_APP_ID").cloned(),
            private_key: vars.get("GITHUB_PRIVATE_KEY").cloned(),
            installation_id: vars.get("GITHUB_INSTALLATION_ID").cloned(),
            webhook_secret: vars.get("GITHUB_WEBHOOK_SECRET").cloned(),
            token: vars.get("GITHUB_TOKEN").cloned(),
        };

        let state_dir = vars
            .get("STATE_DIR")
            .map_or_else(|| PathBuf::from("data"), PathBuf::from);

        Ok(Self {
            enabled_services,
            agents,
            github,
            webhook_secret: vars.get("WEBHOOK_SECRET").cloned(),
            webhook_callback_url: vars.get("WEBHOOK_CALLBACK_URL").cloned(),
            http_port,
            state_dir,
            debounce_window: Duration::from_millis(debounce_ms),
            skills_dir: vars.get("SKILLS_DIR").map(PathBuf::from),
            vars,
        })
    }

    /// Look up an agent by registry name.
    #[must_use]
    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|agent| agent.name == name)
    }

    /// The agent serving unqualified ingress routes.
    ///
    /// Registry validation guarantees exactly one default entry.
    #[must_use]
    pub fn default_agent(&self) -> &AgentConfig {
        self.agents
            .iter()
            .find(|agent| agent.is_default)
            .unwrap_or(&self.agents[0])
    }

    /// Resolve a credential for an agent: `<VAR>__<AGENT>` (agent name
    /// uppercased, non-alphanumerics mapped to `_`) wins over the plain
    /// variable.
    #[must_use]
    pub fn credential_for_agent(&self, var: &str, agent_name: &str) -> Option<String> {
        let suffix: String = agent_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        self.vars
            .get(&format!("{var}__{suffix}"))
            .or_else(|| self.vars.get(var))
            .cloned()
    }

    /// Path of the persisted session document.
    #[must_use]
    pub fn sessions_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    /// Directory holding one bare repository per logical repo.
    #[must_use]
    pub fn repos_dir(&self) -> PathBuf {
        self.state_dir.join("repos")
    }

    /// Directory holding one worktree per live session.
    #[must_use]
    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir.join("worktrees")
    }
}

/// Parse the agent registry from `AGENTS_JSON`, falling back to a
/// single-entry registry derived from `ACP_AGENT_COMMAND`.
fn parse_agent_registry(vars: &HashMap<String, String>) -> Result<Vec<AgentConfig>> {
    if let Some(raw) = vars.get("AGENTS_JSON") {
        let entries: HashMap<String, AgentEntry> = serde_json::from_str(raw)
            .map_err(|err| AppError::Config(format!("invalid AGENTS_JSON: {err}")))?;
        if entries.is_empty() {
            return Err(AppError::Config("AGENTS_JSON must not be empty".into()));
        }

        let mut agents: Vec<AgentConfig> = entries
            .into_iter()
            .map(|(name, entry)| AgentConfig {
                name,
                command: entry.command,
                args: entry.args,
                is_default: entry.default,
            })
            .collect();
        // Deterministic ordering regardless of map iteration order.
        agents.sort_by(|a, b| a.name.cmp(&b.name));

        match agents.iter().filter(|agent| agent.is_default).count() {
            0 => agents[0].is_default = true,
            1 => {}
            n => {
                return Err(AppError::Config(format!(
                    "AGENTS_JSON marks {n} agents as default; expected at most one"
                )))
            }
        }
        return Ok(agents);
    }

    if let Some(raw) = vars.get("ACP_AGENT_COMMAND") {
        let mut parts = raw.split_whitespace().map(str::to_owned);
        let command = parts
            .next()
            .ok_or_else(|| AppError::Config("ACP_AGENT_COMMAND must not be empty".into()))?;
        let name = PathBuf::from(&command)
            .file_stem()
            .map_or_else(|| command.clone(), |stem| stem.to_string_lossy().into_owned());
        return Ok(vec![AgentConfig {
            name,
            command,
            args: parts.collect(),
            is_default: true,
        }]);
    }

    Err(AppError::Config(
        "no agents configured: set ACP_AGENT_COMMAND or AGENTS_JSON".into(),
    ))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}
