use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    Json,
};
use std::sync::Arc;
use tracing::{debug, error};

use crate::gateway::GatewayError;
use crate::models::{PluginRequest, PluginResponse};
use crate::AppState;

/// Plugin webhook, mounted on every path
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    method: Method,
    body: Bytes,
) -> Result<Json<PluginResponse>, (StatusCode, String)> {
    if method != Method::POST {
        return Err((
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed.".to_string(),
        ));
    }

    let request: PluginRequest = serde_json::from_slice(&body).map_err(|e| {
        debug!("Rejecting malformed plugin request: {}", e);
        (StatusCode::BAD_REQUEST, format!("Malformed request: {}", e))
    })?;

    let gateway = state.gateway.clone();
    let result = tokio::task::spawn_blocking(move || gateway.handle(request))
        .await
        .map_err(|e| {
            error!("Plugin request task failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
        })?;

    match result {
        Ok(response) => Ok(Json(response)),
        Err(GatewayError::UnsupportedOperation(op)) => {
            debug!("Operation '{}' not handled by this plugin", op);
            Err((StatusCode::METHOD_NOT_ALLOWED, "Not allowed.".to_string()))
        }
        Err(e @ (GatewayError::MalformedContent(_) | GatewayError::InvalidProxyName(_))) => {
            debug!("{}", e);
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(GatewayError::Allocator(e)) => {
            error!("Port allocator failed, shutting down: {}", e);
            state.fatal.cancel();
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Port allocation unavailable".to_string(),
            ))
        }
    }
}
