use crate::config::GatewayConfig;
use crate::discovery::{ServiceDiscovery, StaticDiscovery};
use crate::dispatch::ResilientDispatcher;
use crate::error::{CallFault, GatewayError, Result};
use crate::metrics::MetricsService;
use crate::resilience::ResilienceRegistry;
use crate::router::{Route, Router, UpstreamTarget};
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, Response, StatusCode},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Buffered request ready to be sent (and re-sent) upstream
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path plus optional `?query`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn new(method: Method, path_and_query: impl Into<String>) -> Self {
        Self {
            method,
            path_and_query: path_and_query.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Buffer an inbound request
    pub async fn from_request(req: Request<Body>) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| GatewayError::InvalidRequest(format!("Failed to read request body: {}", e)))?
            .to_bytes();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
        })
    }

    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.path_and_query.split_once('?').map(|(_, query)| query)
    }

    /// Same request with the path replaced and the query kept
    pub fn with_path(mut self, path: &str) -> Self {
        self.path_and_query = match self.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };
        self
    }
}

/// Fully buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// The raw call to an upstream service.
///
/// Implementations return `Ok` for informational, success and redirect
/// statuses and `Err(CallFault::UpstreamStatus)` for every 4xx/5xx.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn call(
        &self,
        route: &Route,
        request: UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, CallFault>;
}

/// Forwards requests over HTTP with reqwest
pub struct HttpUpstream {
    client: reqwest::Client,
    discovery: Arc<dyn ServiceDiscovery>,
}

impl HttpUpstream {
    /// Create a new HTTP upstream
    pub fn new(timeout: Duration, discovery: Arc<dyn ServiceDiscovery>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, discovery })
    }

    fn base_url(&self, route: &Route) -> std::result::Result<String, CallFault> {
        match &route.upstream {
            UpstreamTarget::Direct(url) => Ok(url.as_str().trim_end_matches('/').to_string()),
            UpstreamTarget::Discovered(service) => self
                .discovery
                .resolve(service)
                .map(|url| url.trim_end_matches('/').to_string())
                .ok_or_else(|| CallFault::NoInstance {
                    service: service.clone(),
                }),
        }
    }

    async fn send(
        &self,
        route: &Route,
        request: UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, CallFault> {
        let backend_url = format!("{}{}", self.base_url(route)?, request.path_and_query);
        debug!(service = %route.service_label, backend_url = %backend_url, "Forwarding to upstream");

        // Build the backend request
        let mut backend_req = self
            .client
            .request(request.method, &backend_url)
            .body(request.body);

        if let Some(timeout) = route.timeout {
            backend_req = backend_req.timeout(timeout);
        }

        // Forward headers (excluding hop-by-hop headers)
        for (name, value) in request.headers.iter() {
            if !is_hop_by_hop_header(name.as_str()) && name.as_str() != "host" {
                backend_req = backend_req.header(name, value);
            }
        }

        if !request.headers.contains_key(REQUEST_ID_HEADER) {
            backend_req = backend_req.header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());
        }

        // Send the request
        let backend_response = backend_req.send().await?;

        let status = backend_response.status();
        let mut headers = HeaderMap::new();
        for (name, value) in backend_response.headers().iter() {
            if !is_hop_by_hop_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        let body = backend_response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn call(
        &self,
        route: &Route,
        request: UpstreamRequest,
    ) -> std::result::Result<UpstreamResponse, CallFault> {
        let response = self
            .send(route, request)
            .await
            .map_err(|fault| CallFault::service_call(&route.service_label, fault))?;

        if response.status.is_client_error() || response.status.is_server_error() {
            return Err(CallFault::UpstreamStatus(response));
        }

        Ok(response)
    }
}

/// Shared state of the HTTP edge
#[derive(Clone)]
pub struct GatewayState {
    pub router: Arc<Router>,
    pub dispatcher: Arc<ResilientDispatcher>,
    pub registry: ResilienceRegistry,
    pub metrics: Option<MetricsService>,
}

impl GatewayState {
    /// Create a new gateway state
    pub fn new(router: Router, dispatcher: ResilientDispatcher) -> Self {
        Self {
            router: Arc::new(router),
            registry: dispatcher.registry().clone(),
            dispatcher: Arc::new(dispatcher),
            metrics: None,
        }
    }

    /// Build everything a configuration describes, talking HTTP to upstreams
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let registry =
            ResilienceRegistry::new(config.circuit_breakers.clone(), config.retries.clone());
        let discovery = Arc::new(StaticDiscovery::new(config.discovery.clone()));
        let router = Router::new(config.routes.clone())?;

        for route in router.routes() {
            if let UpstreamTarget::Discovered(service) = &route.upstream {
                let instances = discovery.instance_count(service);
                if instances == 0 {
                    warn!(
                        route = %route.id,
                        service = %service,
                        "No instances registered, calls will fail until some are"
                    );
                } else {
                    debug!(route = %route.id, service = %service, instances, "Service instances");
                }
            }
        }

        let upstream = HttpUpstream::new(
            Duration::from_secs(config.server.upstream_timeout_secs),
            discovery,
        )?;
        let dispatcher = ResilientDispatcher::new(
            registry,
            Arc::new(upstream),
            Duration::from_secs(config.server.request_timeout_secs),
        );

        Ok(Self::new(router, dispatcher))
    }

    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Main proxy handler that forwards requests to upstream services
pub async fn proxy_handler(
    State(state): State<GatewayState>,
    req: Request<Body>,
) -> Result<Response<Body>> {
    info!(
        method = %req.method(),
        path = %req.uri().path(),
        "Incoming request"
    );

    let request = UpstreamRequest::from_request(req).await?;
    Ok(state.router.route(&state.dispatcher, request).await)
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
