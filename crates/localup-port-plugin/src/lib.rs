//! frp server-plugin that hands out remote ports
//!
//! frps calls this plugin before it registers a proxy. TCP and UDP proxies
//! are given a stable public port from [`PortAllocator`]; every other proxy
//! type is accepted untouched.

pub mod gateway;
pub mod handlers;
pub mod models;

use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use localup_port_allocator::PortAllocator;

pub use gateway::{GatewayError, WebhookGateway};

/// Application state shared across handlers
pub struct AppState {
    pub gateway: Arc<WebhookGateway>,
    /// Cancelled when the allocator can no longer persist decisions
    pub fatal: CancellationToken,
}

/// Plugin server configuration
pub struct PluginServerConfig {
    /// Address to bind the plugin server
    pub bind_addr: SocketAddr,
}

impl Default for PluginServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
        }
    }
}

/// Plugin Server
pub struct PluginServer {
    config: PluginServerConfig,
    state: Arc<AppState>,
}

impl PluginServer {
    pub fn new(config: PluginServerConfig, allocator: Arc<PortAllocator>) -> Self {
        let state = Arc::new(AppState {
            gateway: Arc::new(WebhookGateway::new(allocator)),
            fatal: CancellationToken::new(),
        });

        Self { config, state }
    }

    /// Token cancelled once the server hits an unrecoverable storage error
    pub fn fatal_token(&self) -> CancellationToken {
        self.state.fatal.clone()
    }

    /// Build the router. The webhook answers on any path.
    pub fn build_router(&self) -> Router {
        Router::new()
            .fallback(handlers::handle_webhook)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until Ctrl+C or a fatal storage error
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        let fatal = self.fatal_token();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Port manager plugin listening on {}", self.config.bind_addr);

        let shutdown = fatal.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = shutdown.cancelled() => error!("Stopping after persistence failure"),
                }
            })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        if fatal.is_cancelled() {
            anyhow::bail!("Port map could not be persisted");
        }

        Ok(())
    }
}
