use crate::error::{GatewayError, Result};
use crate::resilience::CircuitState;
use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        // Register all metrics with descriptions
        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        // Request metrics
        describe_counter!(
            "gateway_requests_total",
            "Total number of routed requests by service and final status"
        );
        describe_histogram!(
            "gateway_request_duration_seconds",
            "Routed request latencies in seconds, retries included"
        );

        // Circuit breaker metrics
        describe_gauge!(
            "gateway_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );
        describe_counter!(
            "gateway_circuit_breaker_transitions_total",
            "Total number of circuit breaker state transitions"
        );
        describe_counter!(
            "gateway_circuit_breaker_calls_total",
            "Calls seen by a circuit breaker, by outcome"
        );

        // Retry metrics
        describe_counter!(
            "gateway_retry_calls_total",
            "Calls executed by a retry policy, by outcome"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Prometheus text exposition response
    pub fn response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.render()));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        response
    }
}

/// Record a routed request
pub fn record_request(service: &str, status: u16, duration: f64) {
    let labels = [
        ("service", service.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!(
        "gateway_request_duration_seconds",
        &[("service", service.to_string())]
    )
    .record(duration);
}

/// Record circuit breaker state
pub fn record_breaker_state(breaker: &str, state: CircuitState) {
    let labels = [("breaker", breaker.to_string())];
    gauge!("gateway_circuit_breaker_state", &labels).set(state.as_gauge());
}

/// Record circuit breaker transition
pub fn record_breaker_transition(breaker: &str, from: CircuitState, to: CircuitState) {
    let labels = [
        ("breaker", breaker.to_string()),
        ("from", from.to_string()),
        ("to", to.to_string()),
    ];
    counter!("gateway_circuit_breaker_transitions_total", &labels).increment(1);
    record_breaker_state(breaker, to);
}

/// Record a call outcome seen by a breaker
pub fn record_breaker_call(breaker: &str, kind: &'static str) {
    let labels = [("breaker", breaker.to_string()), ("kind", kind.to_string())];
    counter!("gateway_circuit_breaker_calls_total", &labels).increment(1);
}

/// Record a call finished by a retry policy
pub fn record_retry_call(retry: &str, kind: &'static str) {
    let labels = [("retry", retry.to_string()), ("kind", kind.to_string())];
    counter!("gateway_retry_calls_total", &labels).increment(1);
}

/// Timer for measuring request duration
pub struct Timer {
    start: Instant,
    service: String,
}

impl Timer {
    /// Start a new timer for a request
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            service: service.into(),
        }
    }

    /// Record the elapsed time with the given status code
    pub fn record(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        record_request(&self.service, status, duration);
    }

    /// Get the elapsed time in seconds
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
