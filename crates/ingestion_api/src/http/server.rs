use crate::broadcast::ChannelBroadcaster;
use crate::domain::WebhookIngestionService;
use crate::http::{dashboard_socket, receive_webhook, webhook_health};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    pub webhook_path: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            webhook_path: "/webhook".to_string(),
        }
    }
}

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<WebhookIngestionService>,
    pub broadcaster: ChannelBroadcaster,
    pub webhook_path: String,
}

pub fn build_router(state: AppState) -> Router {
    let webhook_path = state.webhook_path.clone();

    Router::new()
        .route(&webhook_path, post(receive_webhook).get(webhook_health))
        .route("/ws/telemetry", get(dashboard_socket))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the cancellation token fires, then drain in-flight requests
pub async fn run_http_server(
    config: HttpServerConfig,
    state: AppState,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(%addr, webhook_path = %state.webhook_path, "Starting HTTP server");

    let server = axum::serve(listener, build_router(state)).with_graceful_shutdown(async move {
        cancellation_token.cancelled().await;
        info!("HTTP server shutdown signal received");
    });

    match server.await {
        Ok(()) => {
            info!("HTTP server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("HTTP server error: {}", e);
            Err(e.into())
        }
    }
}
