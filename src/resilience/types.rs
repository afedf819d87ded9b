use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, allowing probe requests
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of most recent call outcomes kept in the sliding window
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,

    /// Outcomes required in the window before rates are evaluated
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: usize,

    /// Failure rate (percent) at or above which the circuit opens
    #[serde(default = "default_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Slow call rate (percent) at or above which the circuit opens
    #[serde(default = "default_rate_threshold")]
    pub slow_call_rate_threshold: f64,

    /// Calls lasting longer than this are slow
    #[serde(default = "default_slow_call_duration_ms")]
    pub slow_call_duration_ms: u64,

    /// Time spent open before probes are let through
    #[serde(default = "default_wait_duration_in_open_ms")]
    pub wait_duration_in_open_ms: u64,

    /// Number of probe calls admitted while half-open
    #[serde(default = "default_permitted_calls_in_half_open")]
    pub permitted_calls_in_half_open: u32,
}

fn default_sliding_window_size() -> usize {
    100
}

fn default_minimum_calls() -> usize {
    100
}

fn default_rate_threshold() -> f64 {
    50.0
}

fn default_slow_call_duration_ms() -> u64 {
    60_000
}

fn default_wait_duration_in_open_ms() -> u64 {
    60_000
}

fn default_permitted_calls_in_half_open() -> u32 {
    10
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: default_sliding_window_size(),
            minimum_calls: default_minimum_calls(),
            failure_rate_threshold: default_rate_threshold(),
            slow_call_rate_threshold: default_rate_threshold(),
            slow_call_duration_ms: default_slow_call_duration_ms(),
            wait_duration_in_open_ms: default_wait_duration_in_open_ms(),
            permitted_calls_in_half_open: default_permitted_calls_in_half_open(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn slow_call_duration(&self) -> Duration {
        Duration::from_millis(self.slow_call_duration_ms)
    }

    pub fn wait_duration_in_open(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_ms)
    }

    /// Outcomes needed before rates are evaluated. A window never holds more
    /// than `sliding_window_size` outcomes, so the minimum is capped there.
    pub fn effective_minimum_calls(&self) -> usize {
        self.minimum_calls.min(self.sliding_window_size)
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, the first call included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Classification of a finished call as stored in the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    Slow,
}

/// One finished call
#[derive(Debug, Clone, Copy)]
pub struct OutcomeRecord {
    pub kind: OutcomeKind,
    /// Ran past the slow call threshold, failed or not
    pub slow: bool,
    pub duration: Duration,
}

impl OutcomeRecord {
    /// Classify a finished call. A countable failure is a failure regardless of
    /// its duration; otherwise it is slow when it ran past the threshold.
    pub fn new(failed: bool, duration: Duration, slow_threshold: Duration) -> Self {
        let slow = duration > slow_threshold;
        let kind = if failed {
            OutcomeKind::Failure
        } else if slow {
            OutcomeKind::Slow
        } else {
            OutcomeKind::Success
        };

        Self {
            kind,
            slow,
            duration,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that were let through
    pub permitted_calls: u64,
    /// Calls finished without a countable failure
    pub successful_calls: u64,
    /// Calls finished with a countable failure
    pub failed_calls: u64,
    /// Calls slower than the slow call threshold
    pub slow_calls: u64,
    /// Calls rejected because the circuit was open or probes were exhausted
    pub not_permitted_calls: u64,
    /// Number of times circuit opened
    pub circuit_opened_count: u64,
    /// Number of times circuit closed
    pub circuit_closed_count: u64,
    /// Number of times circuit half-opened
    pub circuit_half_opened_count: u64,
    /// Outcomes currently held in the sliding window
    pub buffered_calls: usize,
    /// Failure rate over the window, `None` until minimum calls are recorded
    pub failure_rate: Option<f64>,
    /// Slow call rate over the window, `None` until minimum calls are recorded
    pub slow_call_rate: Option<f64>,
}

/// Retry metrics
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}
