use axum::{
    routing::{get, post},
    Router,
};
use replicator::AutomatonHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::*;
use crate::{ApiError, ApiResult};

pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(config: crate::Config, automaton: AutomatonHandle) -> Self {
        Self {
            config,
            app_state: Arc::new(AppState { automaton }),
        }
    }

    pub async fn start(&self) -> ApiResult<()> {
        let app = self.router();

        let addr = self.config.bind_address;
        tracing::info!("Starting API server on {}", addr);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| ApiError::InternalError(format!("Server error: {}", e)))?;

        Ok(())
    }

    pub fn router(&self) -> Router {
        Router::new()
            // Storage node protocol
            .route("/nodes", post(register_node))
            .route("/heartbeat/full", post(full_heartbeat))
            .route("/heartbeat/incremental", post(incremental_heartbeat))
            // Client and cross-cell traffic
            .route("/chunks/allocate", post(allocate_write_targets))
            .route("/chunks/batch", post(execute_batch))
            .route("/requisitions/update", post(update_requisitions))
            // Inspection and administration
            .route("/chunks/:id/status", get(chunk_status))
            .route("/nodes/:id", get(node_view))
            .route("/nodes/:id/admin", post(node_admin))
            .route("/health/sets", get(health_sets))
            .route("/health", get(health_check))
            .with_state(self.app_state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .fallback(not_found)
    }
}

async fn not_found() -> ApiResult<axum::response::Response> {
    Err(ApiError::NotFound("No such route".to_string()))
}
