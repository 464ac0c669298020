//! HTTP server for the liveness probe.
//!
//! Serves GET `/health` for an external process supervisor. The response is
//! a fixed 200 and says nothing about platform or store health.

use axum::{routing::get, Router};
use std::net::SocketAddr;

async fn health_handler() -> &'static str {
    "OK"
}

/// Binds `0.0.0.0:port` and serves the `/health` endpoint.
/// This is a long-running task that should be spawned in the background.
pub async fn run_http_server(port: u16) {
    let app = Router::new().route("/health", get(health_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("liveness endpoint listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind liveness endpoint on {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("liveness endpoint error: {}", e);
    }
}
