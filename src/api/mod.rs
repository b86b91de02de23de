//! HTTP API: stateless axum routing around the hub components.
//!
//! Every JSON response is `{ok: true, …}` or `{ok: false, error, code,
//! diagnostics?}`; unknown drones and PRs answer 404, state-machine
//! violations 409. The layer never leaks stack traces.

mod error;
mod preview;
mod routes;

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::Hub;

pub use error::ApiError;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The component graph.
    pub hub: Arc<Hub>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Build the router with state and middleware applied.
#[must_use]
pub fn router(hub: Arc<Hub>) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { hub })
}

/// Serve the API until the hub's shutdown token fires.
pub async fn serve(hub: Arc<Hub>, bind_addr: &str, port: u16) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = format!("{bind_addr}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "hub API listening");

    let shutdown = hub.shutdown_token();
    let app = router(hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
