pub mod agent_ws;
pub mod auth;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod dashboard_ws;
pub mod directory;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;
pub mod store_redis;
pub mod telemetry;
pub mod watchdog;

use axum::{
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::proxy::ProxyState;
use crate::state::GatewayState;

/// Build the gateway router: the two relay upgrade paths plus the
/// gateway's own health/metrics endpoints are intercepted; every other
/// request, including every other WebSocket upgrade, falls through to
/// the reverse proxy.
pub fn app(state: GatewayState, proxy_state: ProxyState) -> Router {
    let relay = Router::new()
        .route("/ws/agent", get(agent_ws::agent_ws_handler))
        .route("/ws/dashboard", get(dashboard_ws::dashboard_ws_handler))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    Router::new()
        .fallback(proxy::proxy_handler)
        .with_state(proxy_state)
        .merge(relay)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
