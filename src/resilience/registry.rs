use super::breaker::CircuitBreaker;
use super::retry::RetryExecutor;
use super::types::{CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState, RetryConfig, RetryMetrics};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Named circuit breakers and retry executors.
///
/// Instances live for the whole process. A name with no configuration gets
/// the default settings the first time it is asked for.
#[derive(Debug, Clone, Default)]
pub struct ResilienceRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    retries: Arc<DashMap<String, Arc<RetryExecutor>>>,
    breaker_configs: Arc<HashMap<String, CircuitBreakerConfig>>,
    retry_configs: Arc<HashMap<String, RetryConfig>>,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    #[serde(flatten)]
    pub metrics: CircuitBreakerMetrics,
}

/// Point-in-time view of one retry executor
#[derive(Debug, Clone, Serialize)]
pub struct RetrySnapshot {
    pub name: String,
    pub max_attempts: u32,
    #[serde(flatten)]
    pub metrics: RetryMetrics,
}

impl ResilienceRegistry {
    /// Create a registry and eagerly build every configured instance
    pub fn new(
        breaker_configs: HashMap<String, CircuitBreakerConfig>,
        retry_configs: HashMap<String, RetryConfig>,
    ) -> Self {
        let registry = Self {
            breakers: Arc::new(DashMap::new()),
            retries: Arc::new(DashMap::new()),
            breaker_configs: Arc::new(breaker_configs),
            retry_configs: Arc::new(retry_configs),
        };

        for name in registry.breaker_configs.keys() {
            registry.circuit_breaker(name);
        }
        for name in registry.retry_configs.keys() {
            registry.retry(name);
        }

        registry
    }

    /// Get or create the circuit breaker with this name
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.breaker_configs.get(name).cloned().unwrap_or_else(|| {
                    debug!(breaker = name, "No configuration for breaker, using defaults");
                    CircuitBreakerConfig::default()
                });
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// Get or create the retry executor with this name
    pub fn retry(&self, name: &str) -> Arc<RetryExecutor> {
        self.retries
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.retry_configs.get(name).cloned().unwrap_or_else(|| {
                    debug!(retry = name, "No configuration for retry, using defaults");
                    RetryConfig::default()
                });
                Arc::new(RetryExecutor::new(name, config))
            })
            .clone()
    }

    /// Get the state of a circuit breaker, closed if it does not exist yet
    pub fn state(&self, name: &str) -> CircuitState {
        self.breakers
            .get(name)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Get all breaker names
    pub fn breaker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot every breaker, sorted by name
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                name: entry.key().clone(),
                state: entry.value().state(),
                metrics: entry.value().metrics(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Snapshot every retry executor, sorted by name
    pub fn retry_snapshots(&self) -> Vec<RetrySnapshot> {
        let mut snapshots: Vec<RetrySnapshot> = self
            .retries
            .iter()
            .map(|entry| RetrySnapshot {
                name: entry.key().clone(),
                max_attempts: entry.value().config().max_attempts,
                metrics: entry.value().metrics(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
