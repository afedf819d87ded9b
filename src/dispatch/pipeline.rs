//! Ordered resilience stages around the raw upstream call.
//!
//! ```text
//! request ──► BreakerStage ──► RetryStage ──► Upstream::call
//!                 │                 │
//!                 │                 └─► re-runs the rest of the chain per attempt
//!                 └─► admits or rejects, records one outcome per run
//! ```
//!
//! Each stage receives a [`Next`] cursor over the stages after it. Calling
//! [`Next::run`] hands the request down; past the last stage it reaches the
//! upstream itself. A pipeline built with a timeout carries one [`Deadline`]
//! through every stage so each can settle its own bookkeeping when it passes.

use crate::error::CallFault;
use crate::proxy::{Upstream, UpstreamRequest, UpstreamResponse};
use crate::resilience::{classify, CircuitBreaker, FailurePredicate, RetryExecutor};
use crate::router::Route;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One capability applied around the upstream call
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name for identification and logging
    fn name(&self) -> &'static str;

    /// Handle a request, usually by delegating to `next` zero or more times
    async fn execute(
        &self,
        request: UpstreamRequest,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, CallFault>;
}

/// Point in time by which a whole pipeline run must finish
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub at: Instant,
    /// Budget the deadline was derived from, reported in timeout faults
    pub timeout: Duration,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }
}

/// Cursor over the stages that have not run yet
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pipeline: &'a Pipeline,
    index: usize,
    deadline: Option<Deadline>,
}

impl<'a> Next<'a> {
    /// Route the request is being dispatched on
    pub fn route(&self) -> &'a Route {
        &self.pipeline.route
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Run the remaining stages, then the upstream call
    pub async fn run(self, request: UpstreamRequest) -> Result<UpstreamResponse, CallFault> {
        match self.pipeline.stages.get(self.index) {
            Some(stage) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                stage.execute(request, next).await
            }
            None => {
                self.pipeline
                    .upstream
                    .call(&self.pipeline.route, request)
                    .await
            }
        }
    }
}

/// The stages for one route, outermost first
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    upstream: Arc<dyn Upstream>,
    route: Arc<Route>,
    timeout: Option<Duration>,
}

impl Pipeline {
    /// Pipeline with no stages, calling the upstream directly
    pub fn new(route: Arc<Route>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            stages: Vec::new(),
            upstream,
            route,
            timeout: None,
        }
    }

    /// Bound every run of this pipeline, retries and backoff included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Append a stage inside the ones already added
    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Breaker outside, retry inside, both judging faults with [`classify`]
    pub fn for_route(
        route: Arc<Route>,
        breaker: Arc<CircuitBreaker>,
        retry: Arc<RetryExecutor>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self::new(route, upstream)
            .with_stage(BreakerStage::new(breaker, classify))
            .with_stage(RetryStage::new(retry, classify))
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Send a request through every stage. Past the deadline no further
    /// attempt is made and the run ends with [`CallFault::CallTimeout`].
    pub async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, CallFault> {
        let deadline = self.timeout.map(Deadline::after);
        let next = Next {
            pipeline: self,
            index: 0,
            deadline,
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.at, next.run(request))
                .await
                .unwrap_or(Err(CallFault::CallTimeout(deadline.timeout))),
            None => next.run(request).await,
        }
    }
}

/// Admission control through a circuit breaker
pub struct BreakerStage {
    breaker: Arc<CircuitBreaker>,
    is_failure: FailurePredicate,
}

impl BreakerStage {
    pub fn new(breaker: Arc<CircuitBreaker>, is_failure: FailurePredicate) -> Self {
        Self {
            breaker,
            is_failure,
        }
    }
}

#[async_trait]
impl Stage for BreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn execute(
        &self,
        request: UpstreamRequest,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, CallFault> {
        match next.deadline() {
            Some(deadline) => {
                self.breaker
                    .execute_until(
                        || next.run(request),
                        self.is_failure,
                        deadline.at,
                        deadline.timeout,
                    )
                    .await
            }
            None => {
                self.breaker
                    .execute(|| next.run(request), self.is_failure)
                    .await
            }
        }
    }
}

/// Bounded retries with exponential backoff
pub struct RetryStage {
    retry: Arc<RetryExecutor>,
    should_retry: FailurePredicate,
}

impl RetryStage {
    pub fn new(retry: Arc<RetryExecutor>, should_retry: FailurePredicate) -> Self {
        Self {
            retry,
            should_retry,
        }
    }
}

#[async_trait]
impl Stage for RetryStage {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn execute(
        &self,
        request: UpstreamRequest,
        next: Next<'_>,
    ) -> Result<UpstreamResponse, CallFault> {
        let service = next.route().service_label.as_str();
        let max_attempts = self.retry.config().max_attempts;

        self.retry
            .execute_with_predicate(
                |attempt| {
                    debug!(
                        service = %service,
                        path = %request.path(),
                        attempt,
                        max_attempts,
                        "Dispatching attempt"
                    );
                    next.run(request.clone())
                },
                self.should_retry,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::{route, status, ScriptedUpstream};
    use crate::resilience::{CircuitBreakerConfig, CircuitState, RetryConfig};
    use axum::http::{Method, StatusCode};

    fn retry(max_attempts: u32) -> Arc<RetryExecutor> {
        Arc::new(RetryExecutor::new(
            "nexusRetry",
            RetryConfig {
                max_attempts,
                initial_backoff_ms: 100,
                max_backoff_ms: 800,
                backoff_multiplier: 2.0,
            },
        ))
    }

    fn breaker(minimum_calls: usize) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "nexusCircuitBreaker",
            CircuitBreakerConfig {
                sliding_window_size: minimum_calls,
                minimum_calls,
                wait_duration_in_open_ms: 10_000,
                permitted_calls_in_half_open: 3,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_stage_order() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![]));
        let pipeline = Pipeline::for_route(route("Nexus"), breaker(5), retry(5), upstream);
        assert_eq!(pipeline.stage_names(), vec!["circuit_breaker", "retry"]);
        assert_eq!(pipeline.route().service_label, "Nexus");
    }

    #[tokio::test]
    async fn test_empty_pipeline_calls_upstream() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![]));
        let pipeline = Pipeline::new(route("Nexus"), upstream.clone());

        let response = pipeline
            .execute(UpstreamRequest::new(Method::GET, "/users"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(upstream.paths(), vec!["/users".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_runs_inside_breaker() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![
            Err(status(502)),
            Err(status(502)),
        ]));
        let breaker = breaker(5);
        let retry = retry(5);
        let pipeline = Pipeline::for_route(route("Nexus"), breaker.clone(), retry.clone(), upstream.clone());

        let response = pipeline
            .execute(UpstreamRequest::new(Method::GET, "/users"))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(upstream.calls(), 3);
        assert_eq!(retry.metrics().successful_calls_with_retry, 1);

        // The whole retry run is one breaker call
        let metrics = breaker.metrics();
        assert_eq!(metrics.permitted_calls, 1);
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_count_once_against_breaker() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(504)));
        let breaker = breaker(5);
        let pipeline = Pipeline::for_route(route("Nexus"), breaker.clone(), retry(3), upstream.clone());

        let fault = pipeline
            .execute(UpstreamRequest::new(Method::GET, "/users"))
            .await
            .unwrap_err();

        assert_eq!(fault.upstream_status(), Some(StatusCode::GATEWAY_TIMEOUT));
        assert_eq!(upstream.calls(), 3);
        assert_eq!(breaker.metrics().failed_calls, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_never_reaches_retry() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(500)));
        let breaker = breaker(1);
        let retry = retry(1);
        let pipeline = Pipeline::for_route(route("Nexus"), breaker.clone(), retry.clone(), upstream.clone());

        pipeline
            .execute(UpstreamRequest::new(Method::GET, "/a"))
            .await
            .unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        let fault = pipeline
            .execute(UpstreamRequest::new(Method::GET, "/b"))
            .await
            .unwrap_err();

        assert!(matches!(fault, CallFault::BreakerOpen { .. }));
        assert_eq!(upstream.calls(), 1);
        let retry_metrics = retry.metrics();
        assert_eq!(
            retry_metrics.failed_calls_with_retry + retry_metrics.failed_calls_without_retry,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_is_not_retried() {
        let upstream = Arc::new(ScriptedUpstream::failing(status(404)));
        let breaker = breaker(1);
        let pipeline = Pipeline::for_route(route("Nexus"), breaker.clone(), retry(5), upstream.clone());

        let fault = pipeline
            .execute(UpstreamRequest::new(Method::GET, "/missing"))
            .await
            .unwrap_err();

        assert_eq!(fault.upstream_status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(upstream.calls(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failed_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_settles_breaker_as_failure() {
        let upstream = Arc::new(
            ScriptedUpstream::failing(status(502)).with_delay(Duration::from_secs(5)),
        );
        let breaker = breaker(5);
        let pipeline = Pipeline::for_route(route("AI"), breaker.clone(), retry(20), upstream.clone())
            .with_timeout(Duration::from_secs(1));

        for _ in 0..5 {
            let fault = pipeline
                .execute(UpstreamRequest::new(Method::GET, "/chat"))
                .await
                .unwrap_err();
            assert!(matches!(fault, CallFault::CallTimeout(t) if t == Duration::from_secs(1)));
        }

        assert_eq!(upstream.calls(), 5);
        assert_eq!(breaker.metrics().failed_calls, 5);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_without_breaker_stage() {
        let upstream = Arc::new(ScriptedUpstream::new(vec![]).with_delay(Duration::from_secs(5)));
        let pipeline =
            Pipeline::new(route("AI"), upstream.clone()).with_timeout(Duration::from_secs(1));

        let fault = pipeline
            .execute(UpstreamRequest::new(Method::GET, "/chat"))
            .await
            .unwrap_err();

        assert_eq!(fault.diagnostic(), "CallTimeout: call timed out after 1s");
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_stage_wraps_upstream() {
        struct Tagging;

        #[async_trait]
        impl Stage for Tagging {
            fn name(&self) -> &'static str {
                "tagging"
            }

            async fn execute(
                &self,
                request: UpstreamRequest,
                next: Next<'_>,
            ) -> Result<UpstreamResponse, CallFault> {
                let mut response = next.run(request.with_path("/tagged")).await?;
                response.status = StatusCode::ACCEPTED;
                Ok(response)
            }
        }

        let upstream = Arc::new(ScriptedUpstream::new(vec![]));
        let pipeline = Pipeline::new(route("AI"), upstream.clone())
            .with_stage(RetryStage::new(retry(2), classify))
            .with_stage(Tagging);

        let response = pipeline
            .execute(UpstreamRequest::new(Method::POST, "/chat"))
            .await
            .unwrap();

        assert_eq!(pipeline.stage_names(), vec!["retry", "tagging"]);
        assert_eq!(response.status, StatusCode::ACCEPTED);
        assert_eq!(upstream.paths(), vec!["/tagged".to_string()]);
    }
}
