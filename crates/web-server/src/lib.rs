//! # Warden Web Server
//!
//! The HTTP and WebSocket surface of the control plane. Handlers are thin:
//! they extract identity, parse the body, call into `engine::ControlPlane`
//! and let `AppError` pick the status code.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use engine::ControlPlane;
use events::BroadcastPublisher;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, Any, CorsLayer, ExposeHeaders},
    trace::TraceLayer,
};

pub mod agent;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod websocket;

/// The shared application state that all handlers can access.
pub struct AppState {
    pub control: Arc<ControlPlane>,
    /// The same bus the control plane publishes on; WebSocket handlers subscribe here.
    pub publisher: BroadcastPublisher,
}

impl AppState {
    pub fn new(control: Arc<ControlPlane>, publisher: BroadcastPublisher) -> Self {
        Self { control, publisher }
    }
}

/// Builds the full router. Split from [`run_server`] so tests can drive it directly.
pub fn build_router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(Any)
        .allow_headers(AllowHeaders::any())
        .expose_headers(ExposeHeaders::any());

    let user_routes = Router::new()
        .route(
            "/api/executors",
            post(handlers::register_executor).get(handlers::list_executors),
        )
        .route(
            "/api/executors/:id",
            get(handlers::get_executor).delete(handlers::delete_executor),
        )
        .route(
            "/api/executors/:id/commands",
            post(handlers::enqueue_command).get(handlers::list_commands),
        )
        .route("/api/commands/:id", get(handlers::get_command))
        .route("/api/emergency-stop", post(handlers::emergency_stop))
        .route("/api/risk/exposure", get(handlers::risk_exposure));

    let agent_routes = Router::new()
        .route("/api/executor/:id/heartbeat", post(agent::heartbeat))
        .route(
            "/api/executor/:id/commands/:cid/status",
            post(agent::update_command_status),
        )
        .route("/api/executor/:id/trades", post(agent::report_trade))
        .route(
            "/api/executor/:id/trades/:ticket/close",
            post(agent::close_trade),
        )
        .route("/api/executor/:id/config", get(agent::agent_config))
        .route(
            "/api/executor/:id/supervisor/evaluate",
            post(agent::evaluate),
        );

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/metrics/delivery", get(handlers::delivery_metrics))
        .merge(user_routes)
        .merge(agent_routes)
        .route("/ws/user", get(websocket::user_socket))
        .route("/ws/executor/:id", get(websocket::executor_socket))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit_bytes))
}

/// Binds `addr` and serves until the process is stopped.
pub async fn run_server(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let body_limit = state.control.settings().server.body_limit_bytes;
    let app = build_router(state, body_limit);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
