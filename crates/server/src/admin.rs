//! Admin HTTP endpoint: `/health` reports a state snapshot from the core,
//! `/metrics` renders the Prometheus registry.

use std::sync::Arc;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::oneshot;

use ferrite_common::{FerriteError, Result};

use crate::core::{CoreMessage, CoreSender};

/// Shared state for the admin handlers.
pub struct AppState {
    pub core: CoreSender,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub async fn serve(addr: String, state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FerriteError::Bind(format!("{}: {}", addr, e)))?;
    tracing::info!(addr = %addr, "Admin endpoint listening");
    axum::serve(listener, router(state))
        .await
        .map_err(FerriteError::Io)?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (tx, rx) = oneshot::channel();
    let queued = state.core.send(CoreMessage::AdminStatus { reply: tx }).is_ok();
    let snapshot = if queued { rx.await.ok() } else { None };

    match snapshot {
        Some(status) => {
            let body = serde_json::json!({
                "status": "healthy",
                "role": status.role,
                "connected_clients": status.connected_clients,
                "connected_replicas": status.connected_replicas,
                "keys": status.keys,
                "repl_offset": status.repl_offset,
            });
            (StatusCode::OK, Json(body))
        }
        None => {
            let body = serde_json::json!({ "status": "unhealthy" });
            (StatusCode::SERVICE_UNAVAILABLE, Json(body))
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
