pub mod pipeline;

pub use pipeline::{BreakerStage, Deadline, Next, Pipeline, RetryStage, Stage};

use crate::error::CallFault;
use crate::metrics::Timer;
use crate::proxy::{Upstream, UpstreamRequest};
use crate::resilience::{is_countable_status, ResilienceRegistry};
use crate::router::Route;
use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const RETRY_ADVICE: &str = "Please try again later";

/// Body of the 503 returned once a service's resilience budget is spent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedResponse {
    pub service: String,
    pub error_message: String,
    pub retry_advice: String,
    pub diagnostic: String,
}

impl DegradedResponse {
    pub fn new(service: &str, fault: &CallFault) -> Self {
        Self {
            service: service.to_string(),
            error_message: format!("{} service is temporarily unavailable", service),
            retry_advice: RETRY_ADVICE.to_string(),
            diagnostic: fault.diagnostic(),
        }
    }
}

impl IntoResponse for DegradedResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::SERVICE_UNAVAILABLE, Json(self)).into_response()
    }
}

/// Runs requests through each route's breaker and retry policy and turns
/// terminal faults into degraded responses.
pub struct ResilientDispatcher {
    registry: ResilienceRegistry,
    upstream: Arc<dyn Upstream>,
    /// Edge deadline for one whole dispatch, retries and backoff included
    request_timeout: Duration,
}

impl ResilientDispatcher {
    pub fn new(
        registry: ResilienceRegistry,
        upstream: Arc<dyn Upstream>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            upstream,
            request_timeout,
        }
    }

    pub fn registry(&self) -> &ResilienceRegistry {
        &self.registry
    }

    /// Stage pipeline for a route, using the breaker and retry it names and
    /// bounded by the edge deadline
    pub fn pipeline(&self, route: &Arc<Route>) -> Pipeline {
        Pipeline::for_route(
            route.clone(),
            self.registry.circuit_breaker(&route.breaker_name),
            self.registry.retry(&route.retry_name),
            self.upstream.clone(),
        )
        .with_timeout(self.request_timeout)
    }

    /// Forward `request` on `route`. Never fails: successful and non-countable
    /// upstream responses are returned as they are, anything else becomes a 503.
    pub async fn dispatch(&self, request: UpstreamRequest, route: &Arc<Route>) -> Response<Body> {
        let timer = Timer::new(&route.service_label);
        let method = request.method.clone();
        let path = request.path().to_string();
        let pipeline = self.pipeline(route);

        let result = pipeline.execute(request).await;

        let response = match result {
            Ok(upstream_response) => {
                info!(
                    service = %route.service_label,
                    method = %method,
                    path = %path,
                    status = upstream_response.status.as_u16(),
                    duration_ms = (timer.elapsed() * 1000.0) as u64,
                    "Upstream call succeeded"
                );
                upstream_response.into_response()
            }
            Err(CallFault::UpstreamStatus(upstream_response))
                if !is_countable_status(upstream_response.status) =>
            {
                info!(
                    service = %route.service_label,
                    method = %method,
                    path = %path,
                    status = upstream_response.status.as_u16(),
                    "Passing upstream error status through"
                );
                upstream_response.into_response()
            }
            Err(fault) => {
                match &fault {
                    CallFault::BreakerOpen { breaker } => warn!(
                        service = %route.service_label,
                        path = %path,
                        breaker = %breaker,
                        "Circuit open, returning degraded response"
                    ),
                    _ => error!(
                        service = %route.service_label,
                        path = %path,
                        status = fault.upstream_status().map(|s| s.as_u16()),
                        error = %fault,
                        "Upstream call failed, returning degraded response"
                    ),
                }
                DegradedResponse::new(&route.service_label, &fault).into_response()
            }
        };

        timer.record(response.status().as_u16());
        response
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{response, route, status, ScriptedUpstream};
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, CircuitState, RetryConfig};
    use axum::http::Method;
    use std::collections::HashMap;

    fn registry(max_attempts: u32) -> ResilienceRegistry {
        let breakers = HashMap::from([(
            "nexusCircuitBreaker".to_string(),
            CircuitBreakerConfig {
                sliding_window_size: 5,
                minimum_calls: 5,
                failure_rate_threshold: 50.0,
                slow_call_rate_threshold: 50.0,
                slow_call_duration_ms: 500,
                wait_duration_in_open_ms: 10_000,
                permitted_calls_in_half_open: 3,
            },
        )]);
        let retries = HashMap::from([(
            "nexusRetry".to_string(),
            RetryConfig {
                max_attempts,
                initial_backoff_ms: 100,
                max_backoff_ms: 800,
                backoff_multiplier: 2.0,
            },
        )]);
        ResilienceRegistry::new(breakers, retries)
    }

    fn dispatcher(max_attempts: u32, upstream: Arc<ScriptedUpstream>) -> ResilientDispatcher {
        ResilientDispatcher::new(registry(max_attempts), upstream, Duration::from_secs(60))
    }

    fn get(path: &str) -> UpstreamRequest {
        UpstreamRequest::new(Method::GET, path)
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_is_returned() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Ok(response(201, "created"))]));
        let dispatcher = dispatcher(5, upstream.clone());

        let response = dispatcher.dispatch(get("/users"), &route("Nexus")).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"created");
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_passes_through_untouched() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![Err(CallFault::UpstreamStatus(
            response(404, "no such user"),
        ))]));
        let dispatcher = dispatcher(5, upstream.clone());

        let response = dispatcher.dispatch(get("/users/7"), &route("Nexus")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"no such user");

        // No retry attempt consumed and nothing counted against the breaker
        assert_eq!(upstream.calls(), 1);
        let breaker = dispatcher.registry().circuit_breaker("nexusCircuitBreaker");
        assert_eq!(breaker.metrics().failed_calls, 0);
        assert_eq!(breaker.metrics().successful_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_countable_server_error_passes_through() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(503)));
        let dispatcher = dispatcher(5, upstream.clone());

        let response = dispatcher.dispatch(get("/health"), &route("Nexus")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls(), 1);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_produce_degraded_response() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(502)));
        let dispatcher = dispatcher(5, upstream.clone());

        let response = dispatcher.dispatch(get("/orders"), &route("Nexus")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls(), 5);

        let body: DegradedResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(body.service, "Nexus");
        assert_eq!(body.error_message, "Nexus service is temporarily unavailable");
        assert_eq!(body.retry_advice, RETRY_ADVICE);
        assert_eq!(
            body.diagnostic,
            "UpstreamStatus: upstream responded with 502 Bad Gateway"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_fault_diagnostic_keeps_wrapper() {
        let fault = CallFault::service_call("Nexus", CallFault::Connect("connection refused".into()));
        let upstream = Arc::new(ScriptedUpstream::failing(fault));
        let dispatcher = dispatcher(2, upstream.clone());

        let response = dispatcher.dispatch(get("/orders"), &route("Nexus")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls(), 2);
        let body = body_json(response).await;
        assert_eq!(
            body["diagnostic"],
            "ServiceCallError: failed to call Nexus: connection refused: connection refused"
        );
    }

    #[tokio::test]
    async fn test_breaker_opens_at_failure_threshold() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Err(status(502)),
            Ok(response(200, "ok")),
            Err(status(500)),
            Ok(response(200, "ok")),
            Err(status(504)),
        ]));
        let dispatcher = dispatcher(1, upstream.clone());
        let nexus = route("Nexus");

        for _ in 0..4 {
            dispatcher.dispatch(get("/x"), &nexus).await;
            assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Closed);
        }
        dispatcher.dispatch(get("/x"), &nexus).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_breaker_stays_closed_below_threshold() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Err(status(502)),
            Ok(response(200, "ok")),
            Err(status(500)),
            Ok(response(200, "ok")),
            Ok(response(200, "ok")),
        ]));
        let dispatcher = dispatcher(1, upstream.clone());
        let nexus = route("Nexus");

        for _ in 0..5 {
            dispatcher.dispatch(get("/x"), &nexus).await;
        }
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Closed);
        assert_eq!(
            dispatcher
                .registry()
                .circuit_breaker("nexusCircuitBreaker")
                .metrics()
                .failure_rate,
            Some(40.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_until_wait_elapses() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Err(status(502)),
            Err(status(502)),
            Err(status(502)),
            Err(status(502)),
            Err(status(502)),
        ]));
        let dispatcher = dispatcher(1, upstream.clone());
        let nexus = route("Nexus");

        for _ in 0..5 {
            dispatcher.dispatch(get("/x"), &nexus).await;
        }
        assert_eq!(upstream.calls(), 5);

        let response = dispatcher.dispatch(get("/x"), &nexus).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls(), 5);
        let body = body_json(response).await;
        assert_eq!(
            body["diagnostic"],
            "CallNotPermitted: circuit breaker 'nexusCircuitBreaker' is OPEN and does not permit further calls"
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::HalfOpen);

        let response = dispatcher.dispatch(get("/x"), &nexus).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probes_close_the_breaker() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(500)));
        let dispatcher = dispatcher(1, upstream.clone());
        let nexus = route("Nexus");

        for _ in 0..5 {
            dispatcher.dispatch(get("/x"), &nexus).await;
        }
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(10)).await;

        // Three probes; a client error is still a healthy answer
        upstream.push(Ok(response(200, "ok")));
        upstream.push(Err(CallFault::UpstreamStatus(response(404, ""))));
        upstream.push(Ok(response(200, "ok")));
        for _ in 0..2 {
            dispatcher.dispatch(get("/x"), &nexus).await;
            assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::HalfOpen);
        }
        dispatcher.dispatch(get("/x"), &nexus).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Closed);

        let metrics = dispatcher
            .registry()
            .circuit_breaker("nexusCircuitBreaker")
            .metrics();
        assert_eq!(metrics.buffered_calls, 0);
        assert_eq!(metrics.circuit_closed_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(502)));
        let dispatcher = dispatcher(1, upstream.clone());
        let nexus = route("Nexus");

        for _ in 0..5 {
            dispatcher.dispatch(get("/x"), &nexus).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        upstream.push(Ok(response(200, "ok")));
        dispatcher.dispatch(get("/x"), &nexus).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::HalfOpen);

        // Second probe hits the scripted 502
        dispatcher.dispatch(get("/x"), &nexus).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Open);

        // The open wait starts again from the reopening
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(dispatcher.registry().state("nexusCircuitBreaker"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edge_deadline_stops_attempts() {
        let upstream = Arc::new(
            ScriptedUpstream::failing(status(502)).with_delay(Duration::from_secs(5)),
        );
        let dispatcher =
            ResilientDispatcher::new(registry(5), upstream.clone(), Duration::from_secs(1));

        let response = dispatcher.dispatch(get("/slow"), &route("Nexus")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["diagnostic"], "CallTimeout: call timed out after 1s");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(upstream.calls(), 1);

        // The abandoned call counts against the circuit
        let metrics = dispatcher
            .registry()
            .circuit_breaker("nexusCircuitBreaker")
            .metrics();
        assert_eq!(metrics.permitted_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.buffered_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_upstream_opens_circuit() {
        let upstream = Arc::new(
            ScriptedUpstream::failing(status(502)).with_delay(Duration::from_secs(5)),
        );
        let dispatcher =
            ResilientDispatcher::new(registry(20), upstream.clone(), Duration::from_secs(1));

        for _ in 0..5 {
            let response = dispatcher.dispatch(get("/slow"), &route("Nexus")).await;
            let body = body_json(response).await;
            assert_eq!(body["diagnostic"], "CallTimeout: call timed out after 1s");
        }
        assert_eq!(
            dispatcher.registry().state("nexusCircuitBreaker"),
            CircuitState::Open
        );

        // Short-circuited from here on
        let response = dispatcher.dispatch(get("/slow"), &route("Nexus")).await;
        let body = body_json(response).await;
        assert!(body["diagnostic"]
            .as_str()
            .unwrap()
            .starts_with("CallNotPermitted"));
        assert_eq!(upstream.calls(), 5);
    }

    #[tokio::test]
    async fn test_unconfigured_names_get_defaults() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![]));
        let dispatcher = dispatcher(5, upstream.clone());

        let response = dispatcher.dispatch(get("/chat"), &route("AI")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let breaker = dispatcher.registry().circuit_breaker("aiCircuitBreaker");
        assert_eq!(breaker.config(), &CircuitBreakerConfig::default());
        assert_eq!(dispatcher.registry().retry("aiRetry").config(), &RetryConfig::default());
    }

    #[test]
    fn test_pipeline_for_route_uses_named_instances() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![]));
        let dispatcher = dispatcher(5, upstream);
        let pipeline = dispatcher.pipeline(&route("Nexus"));
        assert_eq!(pipeline.stage_names(), vec!["circuit_breaker", "retry"]);
        assert_eq!(
            dispatcher.registry().breaker_names(),
            vec!["nexusCircuitBreaker".to_string()]
        );
    }
}
