//! Axum-based voice gateway server.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::state::GatewayState;

/// Client websocket on `path`, plus `/health` (and `/metrics` with the
/// `prometheus` feature).
pub fn router(state: Arc<GatewayState>, path: &str) -> Router {
    let app = Router::new()
        .route(path, get(ws_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "prometheus")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let config = state.manager.config();
    let addr = format!("{}:{}", config.bind_addr(), config.port());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}{}", config.gateway().path);

    serve_gateway(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener. When `shutdown` resolves every live
/// session is disposed before the server stops.
pub async fn serve_gateway<F>(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let path = state.manager.config().gateway().path;
    let app = router(state.clone(), &path);

    let manager = state.manager.clone();
    let shutdown = async move {
        shutdown.await;
        manager.shutdown_all().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { state.manager.serve_client(socket).await })
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let sessions = state.manager.active_sessions().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
        "uptime_secs": state.uptime_secs(),
    }))
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    use axum::http::StatusCode;

    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
