use crate::error::{GatewayError, Result};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::router::UpstreamTarget;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Logical service name to instance base URLs, used by `lb://` upstreams
    #[serde(default)]
    pub discovery: HashMap<String, Vec<String>>,
    /// Route definitions, matched in this order
    pub routes: Vec<RouteConfig>,
    /// Circuit breaker settings by breaker name
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    /// Retry settings by retry name
    #[serde(default)]
    pub retries: HashMap<String, RetryConfig>,
    /// Metrics exposition
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deadline for a whole inbound request, retries included
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Default timeout for a single upstream call
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route identifier
    pub id: String,
    /// Path prefix, e.g. "/nexus" or "/nexus/**"
    pub prefix: String,
    /// Upstream target: "http(s)://host:port" or "lb://ServiceName"
    pub upstream: String,
    /// Name of the circuit breaker guarding this route
    pub circuit_breaker: String,
    /// Name of the retry policy for this route
    pub retry: String,
    /// Human readable service name used in logs and degraded responses
    pub service_label: String,
    /// Per-call timeout overriding the server default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    60
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();

        // Validate routes
        for route in &self.routes {
            if route.prefix.is_empty() {
                return Err(GatewayError::InvalidRoute(format!(
                    "Route prefix cannot be empty for route: {}",
                    route.id
                )));
            }

            if !route.prefix.starts_with('/') {
                return Err(GatewayError::InvalidRoute(format!(
                    "Route prefix must start with '/' for route: {}",
                    route.id
                )));
            }

            if !ids.insert(route.id.as_str()) {
                return Err(GatewayError::InvalidRoute(format!(
                    "Duplicate route id: {}",
                    route.id
                )));
            }

            if let UpstreamTarget::Discovered(service) = UpstreamTarget::parse(&route.upstream)? {
                if !self.discovery.contains_key(&service) {
                    return Err(GatewayError::InvalidRoute(format!(
                        "No discovery entry for service '{}' used by route: {}",
                        service, route.id
                    )));
                }
            }

            if !self.circuit_breakers.contains_key(&route.circuit_breaker) {
                return Err(GatewayError::Config(format!(
                    "Route {} references undefined circuit breaker '{}'",
                    route.id, route.circuit_breaker
                )));
            }

            if !self.retries.contains_key(&route.retry) {
                return Err(GatewayError::Config(format!(
                    "Route {} references undefined retry '{}'",
                    route.id, route.retry
                )));
            }
        }

        for (name, breaker) in &self.circuit_breakers {
            validate_breaker(name, breaker)?;
        }

        for (name, retry) in &self.retries {
            validate_retry(name, retry)?;
        }

        if !self.metrics.path.starts_with('/') {
            return Err(GatewayError::Config(
                "Metrics path must start with '/'".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            discovery: HashMap::new(),
            routes: vec![],
            circuit_breakers: HashMap::new(),
            retries: HashMap::new(),
            metrics: MetricsConfig::default(),
        }
    }

    /// The reference deployment: Nexus, AI and Tools behind one gateway
    pub fn reference() -> Self {
        let mut config = Self::default_config();

        let services = [
            // id, discovery name, label, attempts, window, minimum calls,
            // open wait ms, half-open probes, slow call ms
            ("nexus", "Nexus", "Nexus", 5, 10, 5, 10_000, 3, 500),
            ("ai", "AI", "AI", 20, 20, 10, 30_000, 5, 30_000),
            ("tools", "MCP", "Tools", 15, 15, 8, 20_000, 4, 30_000),
        ];

        for (id, service, label, attempts, window, minimum, wait_ms, probes, slow_ms) in services {
            let breaker = format!("{}CircuitBreaker", id);
            let retry = format!("{}Retry", id);

            config.routes.push(RouteConfig {
                id: id.to_string(),
                prefix: format!("/{}/**", id),
                upstream: format!("lb://{}", service),
                circuit_breaker: breaker.clone(),
                retry: retry.clone(),
                service_label: label.to_string(),
                timeout_ms: None,
            });

            config.circuit_breakers.insert(
                breaker,
                CircuitBreakerConfig {
                    sliding_window_size: window,
                    minimum_calls: minimum,
                    failure_rate_threshold: 50.0,
                    slow_call_rate_threshold: 50.0,
                    slow_call_duration_ms: slow_ms,
                    wait_duration_in_open_ms: wait_ms,
                    permitted_calls_in_half_open: probes,
                },
            );

            config.retries.insert(
                retry,
                RetryConfig {
                    max_attempts: attempts,
                    initial_backoff_ms: 100,
                    max_backoff_ms: 800,
                    backoff_multiplier: 2.0,
                },
            );

            config.discovery.insert(service.to_string(), vec![]);
        }

        config
    }
}

fn validate_breaker(name: &str, breaker: &CircuitBreakerConfig) -> Result<()> {
    let invalid = |what: &str| {
        Err(GatewayError::Config(format!(
            "Circuit breaker '{}': {}",
            name, what
        )))
    };

    if breaker.sliding_window_size == 0 {
        return invalid("sliding_window_size must be > 0");
    }
    if breaker.minimum_calls == 0 {
        return invalid("minimum_calls must be > 0");
    }
    if breaker.minimum_calls > breaker.sliding_window_size {
        warn!(
            breaker = %name,
            minimum_calls = breaker.minimum_calls,
            sliding_window_size = breaker.sliding_window_size,
            "minimum_calls exceeds the window, capping it at sliding_window_size"
        );
    }
    for (field, value) in [
        ("failure_rate_threshold", breaker.failure_rate_threshold),
        ("slow_call_rate_threshold", breaker.slow_call_rate_threshold),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            return invalid(&format!("{} must be in (0, 100]", field));
        }
    }
    if breaker.permitted_calls_in_half_open == 0 {
        return invalid("permitted_calls_in_half_open must be > 0");
    }

    Ok(())
}

fn validate_retry(name: &str, retry: &RetryConfig) -> Result<()> {
    if retry.max_attempts == 0 {
        return Err(GatewayError::Config(format!(
            "Retry '{}': max_attempts must be > 0",
            name
        )));
    }
    if retry.backoff_multiplier < 1.0 {
        return Err(GatewayError::Config(format!(
            "Retry '{}': backoff_multiplier must be >= 1.0",
            name
        )));
    }
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        return Err(GatewayError::Config(format!(
            "Retry '{}': max_backoff_ms must be >= initial_backoff_ms",
            name
        )));
    }

    Ok(())
}
