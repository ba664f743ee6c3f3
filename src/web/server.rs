//! HTTP server fronting a rate-limited set of routes.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::RateLimitLayer;
use crate::error::{Result, TollgateError};
use crate::ratelimit::LimiterRegistry;

/// HTTP server whose routes are gated by a shared [`LimiterRegistry`].
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The registry consulted for every protected request
    registry: LimiterRegistry,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, registry: LimiterRegistry) -> Self {
        Self { addr, registry }
    }

    /// Build the router. `/health` bypasses rate limiting.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route_layer(RateLimitLayer::new(self.registry.clone()))
            .route("/health", get(health))
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

async fn index() -> &'static str {
    "ok"
}

async fn health() -> &'static str {
    "healthy"
}
