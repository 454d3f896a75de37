mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::activities::ActivityRegistry;
use crate::engine::WorkflowClient;
use crate::storage::RunStore;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub client: WorkflowClient,
    pub store: Arc<dyn RunStore>,
    pub registry: Arc<ActivityRegistry>,
}

/// Build the trigger-surface router. The external MCP shim and any other
/// agent-facing adapter call these routes; they carry no logic of their own
/// beyond translating HTTP into the client contract.
pub fn router(state: Arc<AppState>, max_body: usize) -> Router {
    Router::new()
        .route("/runs", post(handlers::start_run))
        .route("/runs", get(handlers::list_runs))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/runs/{id}", delete(handlers::delete_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/activities", get(handlers::list_activities))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP trigger surface.
pub async fn serve(host: &str, port: u16, state: Arc<AppState>, max_body: usize) -> Result<()> {
    let app = router(state, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("ChapterFlow trigger API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
