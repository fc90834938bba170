use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::engine::Liveness;
use crate::utils::wait_for_shutdown;

/// How long in-flight requests may run after shutdown is requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn liveness(State(liveness): State<Arc<Liveness>>) -> (StatusCode, &'static str) {
    if liveness.is_healthy().await {
        return (StatusCode::OK, "OK");
    }

    match liveness.last_cycle().await {
        Some(at) => warn!("unhealthy, no checks since {}", at.to_rfc3339()),
        None => warn!("unhealthy, no check cycle has completed yet"),
    }
    (StatusCode::INTERNAL_SERVER_ERROR, "Unhealthy")
}

pub fn create_router(liveness_state: Arc<Liveness>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .layer(TraceLayer::new_for_http())
        .with_state(liveness_state)
}

/// Binds the liveness address. Failing here is fatal at startup.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not listen on {addr}"))?;
    info!("listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serves the liveness endpoint until `shutdown` fires, then drains for at
/// most [`SHUTDOWN_GRACE`].
pub async fn start_server(
    listener: TcpListener,
    liveness_state: Arc<Liveness>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = create_router(liveness_state);
    let mut drain = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { wait_for_shutdown(&mut drain).await })
            .await
    });

    tokio::select! {
        joined = &mut server => return Ok(joined??),
        _ = wait_for_shutdown(&mut shutdown) => {}
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
        Ok(joined) => joined??,
        Err(_) => {
            warn!("liveness server did not drain within {:?}, aborting", SHUTDOWN_GRACE);
            server.abort();
        }
    }
    info!("liveness server stopped");
    Ok(())
}
