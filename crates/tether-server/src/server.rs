use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::connection;
use crate::handlers::EngineState;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub max_send_queue: usize,
    /// How long a connection may sit in the AUTH → ID handshake.
    pub handshake_timeout_secs: u64,
    /// Minimum spacing of durable liveness writes per connection.
    pub liveness_write_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9310,
            max_send_queue: 256,
            handshake_timeout_secs: 30,
            liveness_write_interval_secs: 30,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EngineState>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and start the server. Returns a handle that keeps it alive.
pub async fn start(
    config: ServerConfig,
    engine: Arc<EngineState>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        engine,
        config: Arc::new(config.clone()),
    };
    let router = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "tether server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by `start()` — dropping it does not stop the server,
/// but it carries the bound port for callers that asked for port 0.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "connections": state.engine.registry.count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenKeeper;
    use tether_store::Database;

    fn make_engine() -> Arc<EngineState> {
        let db = Database::in_memory().unwrap();
        Arc::new(EngineState::new(db, TokenKeeper::new("test-secret")))
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState {
            engine: make_engine(),
            config: Arc::new(ServerConfig::default()),
        };
        let _router = build_router(state);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        let handle = start(config, make_engine()).await.unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, make_engine()).await.unwrap();

        let url = format!("http://127.0.0.1:{}/nope", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[test]
    fn default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 9310);
        assert_eq!(config.max_send_queue, 256);
        assert_eq!(config.handshake_timeout_secs, 30);
        assert_eq!(config.liveness_write_interval_secs, 30);
    }
}
