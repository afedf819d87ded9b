use super::types::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, OutcomeKind, OutcomeRecord};
use super::window::SlidingWindow;
use crate::error::CallFault;
use crate::metrics;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker for a single upstream service
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Breaker name, as referenced by routes
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// All mutable state lives behind one lock so that recording an outcome,
    /// evaluating the window and transitioning happen as one step.
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// Current circuit state
    circuit_state: CircuitState,
    /// Recent outcomes, only consulted while closed
    window: SlidingWindow,
    /// Probes let through since entering half-open
    half_open_admitted: u32,
    /// Probes that finished without a countable failure
    half_open_succeeded: u32,
    /// Time when the circuit was opened
    opened_at: Option<Instant>,
    /// Bumped on every transition; outcomes carrying an older epoch are stale
    epoch: u64,
    /// Metrics
    metrics: CircuitBreakerMetrics,
}

/// Admission to call through a breaker.
///
/// Must be settled with [`CallPermit::record`]. A permit dropped unsettled, for
/// example when the inbound request is cancelled, gives its half-open slot back.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    /// Record the outcome of the permitted call
    pub fn record(mut self, failed: bool) -> OutcomeKind {
        self.settled = true;
        let outcome = OutcomeRecord::new(
            failed,
            self.started.elapsed(),
            self.breaker.config.slow_call_duration(),
        );
        self.breaker.on_outcome(self.epoch, outcome);
        outcome.kind
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.epoch);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            breaker = %name,
            sliding_window_size = config.sliding_window_size,
            minimum_calls = config.minimum_calls,
            failure_rate_threshold = config.failure_rate_threshold,
            wait_duration_in_open_ms = config.wait_duration_in_open_ms,
            "Creating circuit breaker"
        );
        metrics::record_breaker_state(&name, CircuitState::Closed);

        Self {
            state: Mutex::new(State {
                circuit_state: CircuitState::Closed,
                window: SlidingWindow::new(config.sliding_window_size),
                half_open_admitted: 0,
                half_open_succeeded: 0,
                opened_at: None,
                epoch: 0,
                metrics: CircuitBreakerMetrics::default(),
            }),
            config,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // No code path panics while holding the lock, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for permission to call the protected service
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CallFault> {
        let mut state = self.lock();
        self.refresh(&mut state);

        let permitted = match state.circuit_state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                debug!(
                    breaker = %self.name,
                    "Circuit breaker open, rejecting call"
                );
                false
            }
            CircuitState::HalfOpen => {
                if state.half_open_admitted < self.config.permitted_calls_in_half_open {
                    state.half_open_admitted += 1;
                    debug!(
                        breaker = %self.name,
                        half_open_admitted = state.half_open_admitted,
                        max = self.config.permitted_calls_in_half_open,
                        "Allowing half-open probe call"
                    );
                    true
                } else {
                    debug!(
                        breaker = %self.name,
                        "Max half-open probes in flight, rejecting"
                    );
                    false
                }
            }
        };

        if !permitted {
            state.metrics.not_permitted_calls += 1;
            metrics::record_breaker_call(&self.name, "not_permitted");
            return Err(CallFault::BreakerOpen {
                breaker: self.name.clone(),
            });
        }

        state.metrics.permitted_calls += 1;
        Ok(CallPermit {
            breaker: self,
            epoch: state.epoch,
            started: Instant::now(),
            settled: false,
        })
    }

    /// Run `call` under the breaker, recording its outcome with `is_failure`
    pub async fn execute<F, Fut, T>(
        &self,
        call: F,
        is_failure: impl Fn(&CallFault) -> bool,
    ) -> Result<T, CallFault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallFault>>,
    {
        let permit = self.try_acquire()?;
        let result = call().await;
        let failed = result.as_ref().err().map(&is_failure).unwrap_or(false);
        permit.record(failed);
        result
    }

    /// Like [`execute`](Self::execute), but gives up at `deadline`. The
    /// abandoned call is judged as a [`CallFault::CallTimeout`], so a hung
    /// upstream still counts against the circuit.
    pub async fn execute_until<F, Fut, T>(
        &self,
        call: F,
        is_failure: impl Fn(&CallFault) -> bool,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<T, CallFault>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallFault>>,
    {
        let permit = self.try_acquire()?;
        let result = match tokio::time::timeout_at(deadline, call()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    breaker = %self.name,
                    timeout = ?timeout,
                    "Call still running at the request deadline, abandoning it"
                );
                Err(CallFault::CallTimeout(timeout))
            }
        };
        let failed = result.as_ref().err().map(&is_failure).unwrap_or(false);
        permit.record(failed);
        result
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.refresh(&mut state);
        state.circuit_state
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut state = self.lock();
        self.refresh(&mut state);
        let rates = state.window.rates(self.config.effective_minimum_calls());
        CircuitBreakerMetrics {
            buffered_calls: state.window.len(),
            failure_rate: rates.map(|r| r.failure_rate),
            slow_call_rate: rates.map(|r| r.slow_call_rate),
            ..state.metrics.clone()
        }
    }

    /// Open the circuit once the wait duration is over
    fn refresh(&self, state: &mut State) {
        if state.circuit_state != CircuitState::Open {
            return;
        }
        match state.opened_at {
            Some(opened_at) if opened_at.elapsed() >= self.config.wait_duration_in_open() => {
                self.transition_to_half_open(state);
            }
            Some(_) => {}
            None => {
                warn!(breaker = %self.name, "Circuit open but no opened_at timestamp");
                self.transition_to_half_open(state);
            }
        }
    }

    fn on_outcome(&self, epoch: u64, outcome: OutcomeRecord) {
        let mut state = self.lock();

        match outcome.kind {
            OutcomeKind::Success => state.metrics.successful_calls += 1,
            OutcomeKind::Failure => state.metrics.failed_calls += 1,
            OutcomeKind::Slow => {
                state.metrics.successful_calls += 1;
                state.metrics.slow_calls += 1;
            }
        }
        let kind = match outcome.kind {
            OutcomeKind::Success => "successful",
            OutcomeKind::Failure => "failed",
            OutcomeKind::Slow => "slow",
        };
        metrics::record_breaker_call(&self.name, kind);
        debug!(
            breaker = %self.name,
            outcome = kind,
            duration_ms = outcome.duration_ms(),
            "Call outcome"
        );

        if epoch != state.epoch {
            debug!(
                breaker = %self.name,
                outcome = ?outcome.kind,
                "Discarding outcome of a call admitted before the last transition"
            );
            return;
        }

        match state.circuit_state {
            CircuitState::Closed => {
                state.window.push(outcome);

                let Some(rates) = state.window.rates(self.config.effective_minimum_calls()) else {
                    return;
                };

                debug!(
                    breaker = %self.name,
                    failure_rate = rates.failure_rate,
                    slow_call_rate = rates.slow_call_rate,
                    buffered_calls = state.window.len(),
                    "Evaluated sliding window"
                );

                if rates.failure_rate >= self.config.failure_rate_threshold
                    || rates.slow_call_rate >= self.config.slow_call_rate_threshold
                {
                    info!(
                        breaker = %self.name,
                        failure_rate = rates.failure_rate,
                        slow_call_rate = rates.slow_call_rate,
                        "Threshold exceeded"
                    );
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                if outcome.kind == OutcomeKind::Failure {
                    warn!(
                        breaker = %self.name,
                        "Half-open probe call failed, reopening circuit"
                    );
                    self.transition_to_open(&mut state);
                    return;
                }

                state.half_open_succeeded += 1;
                debug!(
                    breaker = %self.name,
                    half_open_succeeded = state.half_open_succeeded,
                    permitted = self.config.permitted_calls_in_half_open,
                    "Half-open probe call succeeded"
                );
                if state.half_open_succeeded >= self.config.permitted_calls_in_half_open {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {
                // Epochs change on every transition, so this is unreachable in practice
                debug!(breaker = %self.name, "Recording outcome in open state");
            }
        }
    }

    fn release(&self, epoch: u64) {
        let mut state = self.lock();
        if epoch == state.epoch && state.circuit_state == CircuitState::HalfOpen {
            state.half_open_admitted = state.half_open_admitted.saturating_sub(1);
            debug!(breaker = %self.name, "Released unused half-open probe");
        }
    }

    fn set_state(&self, state: &mut State, to: CircuitState) {
        let from = state.circuit_state;
        state.circuit_state = to;
        state.epoch += 1;
        state.half_open_admitted = 0;
        state.half_open_succeeded = 0;
        metrics::record_breaker_transition(&self.name, from, to);
    }

    /// Transition to open state
    fn transition_to_open(&self, state: &mut State) {
        info!(
            breaker = %self.name,
            from = %state.circuit_state,
            wait = ?self.config.wait_duration_in_open(),
            "Circuit breaker opening"
        );

        self.set_state(state, CircuitState::Open);
        state.opened_at = Some(Instant::now());
        state.window.clear();
        state.metrics.circuit_opened_count += 1;
    }

    /// Transition to half-open state
    fn transition_to_half_open(&self, state: &mut State) {
        info!(
            breaker = %self.name,
            permitted_calls = self.config.permitted_calls_in_half_open,
            "Circuit breaker transitioning to half-open"
        );

        self.set_state(state, CircuitState::HalfOpen);
        state.metrics.circuit_half_opened_count += 1;
    }

    /// Transition to closed state
    fn transition_to_closed(&self, state: &mut State) {
        info!(
            breaker = %self.name,
            probes = state.half_open_succeeded,
            "Circuit breaker closing"
        );

        self.set_state(state, CircuitState::Closed);
        state.opened_at = None;
        state.window.clear();
        state.metrics.circuit_closed_count += 1;
    }
}
