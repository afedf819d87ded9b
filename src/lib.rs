pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod proxy;
pub mod resilience;
pub mod router;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::MetricsService;
use crate::proxy::{proxy_handler, GatewayState};
use axum::{
    body::Body,
    extract::State,
    http::{Response, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router as AxumRouter,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

/// JSON snapshot of every circuit breaker and retry policy
pub const RESILIENCE_PATH: &str = "/gateway/resilience";

/// Build the axum application. Anything not served by the gateway's own
/// endpoints goes through the router.
pub fn app(state: GatewayState, metrics_path: &str) -> AxumRouter {
    let mut app = AxumRouter::new()
        .route(fallback::FALLBACK_PATH, get(fallback::service_unavailable))
        .route(RESILIENCE_PATH, get(resilience_handler));

    if state.metrics.is_some() {
        app = app.route(metrics_path, get(metrics_handler));
    }

    app.fallback(proxy_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Initialize the gateway server
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    // Validate configuration
    config.validate()?;

    info!("Starting API Gateway");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    let mut state = GatewayState::from_config(&config)?;
    info!("Loaded {} routes", state.router.routes().len());
    for route in state.router.routes() {
        info!(
            route = %route.id,
            prefix = %route.prefix,
            upstream = %route.upstream,
            breaker = %route.breaker_name,
            retry = %route.retry_name,
            "Route registered"
        );
    }

    if config.metrics.enabled {
        state = state.with_metrics(MetricsService::new()?);
        info!(path = %config.metrics.path, "Metrics endpoint enabled");
    }

    let app = app(state, &config.metrics.path);

    // Bind and serve
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!("Gateway ready to accept connections");

    axum::serve(listener, app)
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<GatewayState>) -> Response<Body> {
    match &state.metrics {
        Some(metrics) => metrics.response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn resilience_handler(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "circuit_breakers": state.registry.breaker_snapshots(),
        "retries": state.registry.retry_snapshots(),
    }))
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilient_gateway=debug,tower_http=debug".into()),
        )
        .with_target(false)
        .compact()
        .init();
}
