//! Service-neutral webhook adapter.
//!
//! Ingress: `POST /webhooks/webhook` (default agent) or
//! `POST /webhooks/webhook/<agent>`, guarded by a shared-secret
//! `x-bridge-token` header. The request is acknowledged immediately,
//! well under the 5 s acknowledgment deadline; the actual session work
//! runs in a background task.
//!
//! Egress: every update, completion and error is rendered as a JSON
//! `POST` to the session's callback URL (from the inbound event, falling
//! back to `WEBHOOK_CALLBACK_URL`), with bounded retry on transient
//! failures. Delivery failures are logged and dropped — they never affect
//! the session.
//!
//! Event shape:
//!
//! ```json
//! { "session": "issue-41", "prompt": "fix the typo",
//!   "title": "fix-typo", "callback_url": "https://…", "followup": false }
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::adapter::ServiceAdapter;
use crate::config::{AgentConfig, Config};
use crate::models::request::BridgeSessionRequest;
use crate::models::update::BridgeUpdate;
use crate::orchestrator::SessionManager;
use crate::{AppError, Result};

/// Header carrying the shared ingress secret.
const TOKEN_HEADER: &str = "x-bridge-token";

/// Egress delivery attempts before an update is dropped.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Base backoff between egress retries.
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Inbound webhook event shape.
#[derive(Debug, Deserialize)]
struct WebhookEvent {
    /// Logical conversation id on the caller's side.
    session: String,
    /// The user's message.
    prompt: String,
    /// Optional slug for the working branch.
    #[serde(default)]
    title: Option<String>,
    /// Where to deliver updates for this session.
    #[serde(default)]
    callback_url: Option<String>,
    /// Marks an explicit continuation of an existing conversation.
    #[serde(default)]
    followup: bool,
}

/// Webhook-based [`ServiceAdapter`] bound to one configured agent.
pub struct WebhookAdapter {
    service_name: String,
    agent_name: String,
    is_default_agent: bool,
    secret: Option<String>,
    default_callback: Option<String>,
    http: reqwest::Client,
    manager: Arc<SessionManager>,
}

impl WebhookAdapter {
    /// Build the adapter for one agent, resolving agent-scoped credentials
    /// (`WEBHOOK_SECRET__<AGENT>` etc.) from the configuration.
    #[must_use]
    pub fn new(config: &Config, agent: &AgentConfig, manager: Arc<SessionManager>) -> Arc<Self> {
        let service_name = if agent.is_default {
            "webhook".to_owned()
        } else {
            format!("webhook:{}", agent.name)
        };
        Arc::new(Self {
            service_name,
            agent_name: agent.name.clone(),
            is_default_agent: agent.is_default,
            secret: config.credential_for_agent("WEBHOOK_SECRET", &agent.name),
            default_callback: config.credential_for_agent("WEBHOOK_CALLBACK_URL", &agent.name),
            http: reqwest::Client::new(),
            manager,
        })
    }

    /// The ingress route path: the default agent owns the unqualified path.
    #[must_use]
    pub fn route_path(&self) -> String {
        if self.is_default_agent {
            "/webhooks/webhook".to_owned()
        } else {
            format!("/webhooks/webhook/{}", self.agent_name)
        }
    }

    /// Handle one inbound webhook call: authenticate, parse, acknowledge,
    /// and dispatch the real work to a background task.
    async fn handle_ingress(
        self: Arc<Self>,
        headers: HeaderMap,
        body: Value,
    ) -> (StatusCode, Json<Value>) {
        if let Some(secret) = &self.secret {
            let presented = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
            if presented != Some(secret.as_str()) {
                warn!(service = self.service_name.as_str(), "webhook token mismatch");
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "invalid token" })),
                );
            }
        }

        let request = match self.on_session_created(body) {
            Ok(request) => request,
            Err(err) => {
                warn!(service = self.service_name.as_str(), %err, "malformed webhook event");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": err.to_string() })),
                );
            }
        };

        info!(
            service = self.service_name.as_str(),
            external_session_id = request.external_session_id.as_str(),
            followup = request.is_followup,
            "webhook event accepted"
        );

        // Acknowledge now; session work happens off the request path.
        let adapter = Arc::clone(&self);
        tokio::spawn(async move {
            adapter.dispatch(request).await;
        });

        (StatusCode::OK, Json(json!({ "status": "accepted" })))
    }

    /// Route an accepted event into the session manager, reporting failures
    /// back through this adapter's own error channel.
    async fn dispatch(self: Arc<Self>, request: BridgeSessionRequest) {
        let id = request.external_session_id.clone();
        let result = if request.is_followup {
            self.manager
                .handle_followup(&id, &request.prompt, Some(request.service_metadata.clone()))
                .await
        } else {
            let adapter: Arc<dyn ServiceAdapter> = Arc::clone(&self) as Arc<dyn ServiceAdapter>;
            self.manager.handle_new_session(adapter, request).await
        };

        if let Err(err) = result {
            warn!(external_session_id = id.as_str(), %err, "session dispatch failed");
            if let Err(send_err) = self.send_error(&id, &err.to_string()).await {
                warn!(external_session_id = id.as_str(), %send_err, "error delivery failed");
            }
        }
    }

    /// Resolve the callback URL for a session: per-session metadata first,
    /// then the configured default.
    async fn callback_for(&self, external_session_id: &str) -> Option<String> {
        if let Some(metadata) = self.manager.service_metadata(external_session_id).await {
            if let Some(url) = metadata.get("callback_url").and_then(Value::as_str) {
                return Some(url.to_owned());
            }
        }
        self.default_callback.clone()
    }

    /// Deliver one JSON payload to the session's callback with bounded
    /// retry. Without a callback URL the payload is dropped silently —
    /// the deployment simply has no egress channel configured.
    async fn post_event(&self, external_session_id: &str, payload: Value) -> Result<()> {
        let Some(url) = self.callback_for(external_session_id).await else {
            debug!(
                external_session_id,
                "no callback url configured; payload dropped"
            );
            return Ok(());
        };

        let mut last_error = String::new();
        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            match self.http.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = format!("callback returned {}", response.status());
                }
                Err(err) => last_error = err.to_string(),
            }
            if attempt < MAX_DELIVERY_ATTEMPTS {
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
        }

        Err(AppError::Adapter(format!(
            "callback delivery failed after {MAX_DELIVERY_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

impl ServiceAdapter for WebhookAdapter {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn register_routes(self: Arc<Self>, router: Router) -> Router {
        let path = self.route_path();
        let adapter = Arc::clone(&self);
        router.route(
            &path,
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let adapter = Arc::clone(&adapter);
                async move { adapter.handle_ingress(headers, body).await }
            }),
        )
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        // Webhook ingress is passive; nothing to start.
        Box::pin(async { Ok(()) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn on_session_created(&self, event: Value) -> Result<BridgeSessionRequest> {
        let event: WebhookEvent = serde_json::from_value(event)
            .map_err(|err| AppError::Adapter(format!("malformed webhook event: {err}")))?;
        if event.session.is_empty() || event.prompt.trim().is_empty() {
            return Err(AppError::Adapter(
                "webhook event requires non-empty 'session' and 'prompt'".into(),
            ));
        }

        let external_session_id = format!("{}:{}", self.service_name, event.session);
        let descriptive_name = event.title.unwrap_or_else(|| event.session.clone());

        Ok(BridgeSessionRequest {
            external_session_id,
            service_name: self.service_name.clone(),
            agent_name: self.agent_name.clone(),
            prompt: event.prompt,
            descriptive_name,
            is_followup: event.followup,
            service_metadata: json!({ "callback_url": event.callback_url }),
        })
    }

    fn send_update<'a>(
        &'a self,
        external_session_id: &'a str,
        update: &'a BridgeUpdate,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = json!({
                "session": external_session_id,
                "event": "update",
                "update": update,
            });
            self.post_event(external_session_id, payload).await
        })
    }

    fn send_completion<'a>(
        &'a self,
        external_session_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = json!({
                "session": external_session_id,
                "event": "completion",
                "message": message,
            });
            self.post_event(external_session_id, payload).await
        })
    }

    fn send_error<'a>(
        &'a self,
        external_session_id: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = json!({
                "session": external_session_id,
                "event": "error",
                "update": BridgeUpdate::Error { message: error.to_owned() },
            });
            self.post_event(external_session_id, payload).await
        })
    }
}
