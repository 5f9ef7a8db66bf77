//! Service adapter contract.
//!
//! An adapter is the bridge's integration with one external collaboration
//! service: it owns one ingress channel (an HTTP webhook route or a
//! persistent socket) and one egress channel (API calls back to the
//! service). The bridge core depends only on this trait; adding a service
//! means writing a new adapter, never touching the core.
//!
//! Methods return boxed futures so the trait stays object-safe and
//! adapters can be held as `Arc<dyn ServiceAdapter>` throughout the
//! orchestrator.

pub mod webhook;

use axum::Router;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::models::request::BridgeSessionRequest;
use crate::models::update::BridgeUpdate;
use crate::Result;

/// Ingress/egress integration for one external service × one agent.
pub trait ServiceAdapter: Send + Sync {
    /// Unique name per adapter instance (e.g. `"webhook"` or
    /// `"webhook:gemini"`). Persisted session records carry this name, so
    /// it must stay stable across restarts.
    fn service_name(&self) -> &str;

    /// Wire this adapter's ingress HTTP routes into the application router.
    /// Socket-based adapters return the router unchanged.
    fn register_routes(self: std::sync::Arc<Self>, router: Router) -> Router;

    /// Begin background tasks (e.g. open a socket connection). Webhook
    /// adapters have nothing to start.
    ///
    /// # Errors
    ///
    /// Returns an error when the adapter cannot come up; boot fails.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Release adapter resources during shutdown.
    ///
    /// # Errors
    ///
    /// Best-effort; errors are logged by the caller.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Parse an inbound service event into a session request. Adapters that
    /// dispatch to the session manager directly from their own event loop
    /// may return [`AppError::Adapter`](crate::AppError::Adapter) instead.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Adapter`](crate::AppError::Adapter) on malformed
    /// events.
    fn on_session_created(&self, event: Value) -> Result<BridgeSessionRequest>;

    /// Render one user-visible update on the external service.
    ///
    /// # Errors
    ///
    /// Delivery failures are logged and dropped by the forwarder; they must
    /// not kill the session.
    fn send_update<'a>(
        &'a self,
        external_session_id: &'a str,
        update: &'a BridgeUpdate,
    ) -> BoxFuture<'a, Result<()>>;

    /// Deliver the terminal success message of a turn.
    ///
    /// # Errors
    ///
    /// Same contract as [`send_update`](Self::send_update).
    fn send_completion<'a>(
        &'a self,
        external_session_id: &'a str,
        message: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    /// Deliver the terminal failure message of a turn.
    ///
    /// # Errors
    ///
    /// Same contract as [`send_update`](Self::send_update).
    fn send_error<'a>(
        &'a self,
        external_session_id: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}
