use crate::config::RouteConfig;
use crate::dispatch::ResilientDispatcher;
use crate::error::{GatewayError, Result};
use crate::fallback;
use crate::proxy::UpstreamRequest;
use axum::{body::Body, http::Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Where a route forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// Fixed base URL
    Direct(Url),
    /// Logical service name resolved through service discovery
    Discovered(String),
}

impl UpstreamTarget {
    /// Parse `http(s)://host[:port][/base]` or `lb://ServiceName`
    pub fn parse(target: &str) -> Result<Self> {
        if let Some(service) = target.strip_prefix("lb://") {
            let service = service.trim_end_matches('/');
            if service.is_empty() {
                return Err(GatewayError::InvalidRoute(format!(
                    "Missing service name in upstream: {}",
                    target
                )));
            }
            return Ok(UpstreamTarget::Discovered(service.to_string()));
        }

        let url = Url::parse(target).map_err(|e| {
            GatewayError::InvalidRoute(format!("Invalid upstream '{}': {}", target, e))
        })?;

        match url.scheme() {
            "http" | "https" => Ok(UpstreamTarget::Direct(url)),
            scheme => Err(GatewayError::InvalidRoute(format!(
                "Upstream must use http://, https:// or lb://, got '{}://' in {}",
                scheme, target
            ))),
        }
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamTarget::Direct(url) => write!(f, "{}", url),
            UpstreamTarget::Discovered(service) => write!(f, "lb://{}", service),
        }
    }
}

/// Route information
#[derive(Debug, Clone)]
pub struct Route {
    /// Route identifier
    pub id: String,
    /// Normalized prefix without trailing wildcard or slash ("" matches everything)
    pub prefix: String,
    /// Upstream target
    pub upstream: UpstreamTarget,
    /// Circuit breaker name
    pub breaker_name: String,
    /// Retry policy name
    pub retry_name: String,
    /// Service label for logs and degraded responses
    pub service_label: String,
    /// Per-call timeout overriding the client default
    pub timeout: Option<Duration>,
}

impl Route {
    pub fn from_config(config: RouteConfig) -> Result<Self> {
        Ok(Self {
            prefix: normalize_prefix(&config.prefix),
            upstream: UpstreamTarget::parse(&config.upstream)?,
            id: config.id,
            breaker_name: config.circuit_breaker,
            retry_name: config.retry,
            service_label: config.service_label,
            timeout: config.timeout_ms.map(Duration::from_millis),
        })
    }

    /// Path forwarded upstream when `path` falls under this route's prefix
    pub fn strip(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            Some("/".to_string())
        } else if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            // "/nexusfoo" is not under "/nexus"
            None
        }
    }
}

/// Result of matching a route
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The matched route
    pub route: Arc<Route>,
    /// Request path with the prefix removed
    pub forwarded_path: String,
}

/// Gateway router for matching incoming requests to upstream services
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    /// Create a new router from route configurations
    pub fn new(routes: Vec<RouteConfig>) -> Result<Self> {
        let routes = routes
            .into_iter()
            .map(|config| Route::from_config(config).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { routes })
    }

    /// Match a request path; routes are tried in declaration order
    pub fn match_route(&self, path: &str) -> Option<RouteMatch> {
        self.routes.iter().find_map(|route| {
            route.strip(path).map(|forwarded_path| RouteMatch {
                route: route.clone(),
                forwarded_path,
            })
        })
    }

    /// Forward a request to the first matching route's upstream through the
    /// dispatcher. Unmatched requests get the static fallback payload.
    pub async fn route(
        &self,
        dispatcher: &ResilientDispatcher,
        request: UpstreamRequest,
    ) -> Response<Body> {
        let path = request.path().to_string();

        let Some(route_match) = self.match_route(&path) else {
            debug!(path = %path, "No route matched");
            return fallback::unmatched_route();
        };

        debug!(
            route = %route_match.route.id,
            path = %path,
            forwarded_path = %route_match.forwarded_path,
            "Route matched"
        );

        let forwarded = request.with_path(&route_match.forwarded_path);
        dispatcher.dispatch(forwarded, &route_match.route).await
    }

    /// Get all routes in the router, in match order
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}

/// Strip a trailing `/**` or `/*` and any trailing slash
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix
        .strip_suffix("/**")
        .or_else(|| prefix.strip_suffix("/*"))
        .unwrap_or(prefix);
    trimmed.trim_end_matches('/').to_string()
}
