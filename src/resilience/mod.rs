pub mod breaker;
pub mod classifier;
pub mod registry;
pub mod retry;
pub mod types;
pub mod window;

pub use breaker::{CallPermit, CircuitBreaker};
pub use classifier::{classify, is_countable_status, FailurePredicate};
pub use registry::{BreakerSnapshot, ResilienceRegistry, RetrySnapshot};
pub use retry::{CappedExponentialBackoff, RetryExecutor};
pub use types::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, OutcomeKind, OutcomeRecord,
    RetryConfig, RetryMetrics,
};
