use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::routes;
use crate::state::AppState;

/// HTTP + SSE gateway built on axum.
pub struct GatewayServer {
    bind: String,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(bind: impl Into<String>, state: Arc<AppState>) -> Self {
        Self {
            bind: bind.into(),
            state,
        }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/attach", post(routes::attach))
            .route("/detach", post(routes::detach))
            .route("/sessions", get(routes::list_sessions))
            .route("/sessions/{id}/events", get(routes::session_events))
            .route("/sessions/{id}/preview", get(routes::session_preview))
            .route("/search", get(routes::search))
            .route("/projects", get(routes::projects))
            .route("/index/refresh", post(routes::index_refresh))
            .route("/health", get(routes::health))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Serve until the cancellation token fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = Self::router(self.state.clone());
        let listener = TcpListener::bind(&self.bind).await?;
        info!(bind = %self.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
