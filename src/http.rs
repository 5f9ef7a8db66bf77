//! HTTP surface of the bridge process.
//!
//! One axum router: `GET /health` plus whatever ingress routes the enabled
//! adapters register. Served with graceful shutdown driven by the process
//! cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::ServiceAdapter;
use crate::{AppError, Result};

/// Build the application router: the health endpoint plus every adapter's
/// ingress routes.
#[must_use]
pub fn build_router(adapters: &[Arc<dyn ServiceAdapter>]) -> Router {
    let services: Vec<String> = adapters
        .iter()
        .map(|adapter| adapter.service_name().to_owned())
        .collect();

    let mut router = Router::new().route(
        "/health",
        get(move || {
            let services = services.clone();
            async move { Json(json!({ "status": "ok", "services": services })) }
        }),
    );

    for adapter in adapters {
        router = Arc::clone(adapter).register_routes(router);
    }
    router
}

/// Serve `router` on `port` until the token fires.
///
/// # Errors
///
/// Returns `AppError::Config` when the port cannot be bound and
/// `AppError::Io` on server failure.
pub async fn serve(router: Router, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;

    info!(%bind, "http surface listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
        })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("http surface shut down");
    Ok(())
}
