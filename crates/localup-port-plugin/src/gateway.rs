//! Maps plugin requests onto allocator decisions

use std::sync::Arc;

use localup_port_allocator::{
    AllocationKind, AllocatorError, ClientKey, Decision, PortAllocator,
};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::models::{
    needs_port, proxy_type_of, NewProxyContent, PluginRequest, PluginResponse, OP_NEW_PROXY,
};

/// Requests the gateway cannot answer with a protocol response
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Operation '{0}' is not supported")]
    UnsupportedOperation(String),

    #[error("Malformed NewProxy content: {0}")]
    MalformedContent(#[from] serde_json::Error),

    /// The name would not survive a round trip through the port map
    #[error("Proxy name {0:?} must not contain whitespace")]
    InvalidProxyName(String),

    /// The allocator can no longer keep its table durable
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
}

/// Stateless front of the allocator for `NewProxy` webhooks
pub struct WebhookGateway {
    allocator: Arc<PortAllocator>,
}

impl WebhookGateway {
    pub fn new(allocator: Arc<PortAllocator>) -> Self {
        Self { allocator }
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    /// Answer one plugin request.
    ///
    /// Blocks while the allocator persists a new assignment.
    pub fn handle(&self, request: PluginRequest) -> Result<PluginResponse, GatewayError> {
        if request.op != OP_NEW_PROXY {
            return Err(GatewayError::UnsupportedOperation(request.op));
        }

        let mut content = request.content.unwrap_or_default();

        let proxy_type = proxy_type_of(&content);
        if !needs_port(proxy_type) {
            debug!(
                "Proxy type '{}' does not need a port, passing through",
                proxy_type
            );
            return Ok(PluginResponse::pass());
        }

        let proxy = NewProxyContent::from_content(&content)?;
        if !proxy.has_valid_name() {
            return Err(GatewayError::InvalidProxyName(
                proxy.proxy_name().to_string(),
            ));
        }

        let key = ClientKey::new(proxy.proxy_name(), proxy.proxy_type());
        if let Some(metas) = proxy.metas() {
            debug!("[{}] Proxy metadata: {:?}", key, metas);
        }

        let response = match self.allocator.decide(&key, proxy.remote_port())? {
            Decision::Unchanged(_) => PluginResponse::unchanged(content),
            // frps keeps the requested port on its own, so a granted
            // reservation is reported as "no change"
            Decision::Modified {
                kind: AllocationKind::Requested,
                ..
            } => PluginResponse::unchanged(content),
            Decision::Modified {
                port,
                kind: AllocationKind::Automatic,
            } => {
                content.insert("remote_port".to_string(), Value::from(port));
                PluginResponse::modified(content)
            }
            Decision::Rejected(rejection) => PluginResponse::rejected(rejection.to_string()),
        };

        Ok(response)
    }
}
