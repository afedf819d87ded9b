use crate::proxy::UpstreamResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid route configuration: {0}")]
    InvalidRoute(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidRoute(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Fault raised while calling an upstream service.
///
/// Every failure that crosses the resilience pipeline is one of these, so the
/// classifier, the retry stage and the breaker all inspect the same shape.
#[derive(Error, Debug, Clone)]
pub enum CallFault {
    #[error("connection refused: {0}")]
    Connect(String),

    #[error("socket timeout: {0}")]
    SocketTimeout(String),

    #[error("call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("I/O failure: {0}")]
    Io(String),

    /// The upstream answered with an error status. The buffered response is kept
    /// so that non-countable statuses can be handed back to the caller untouched.
    #[error("upstream responded with {}", .0.status)]
    UpstreamStatus(UpstreamResponse),

    #[error("circuit breaker '{breaker}' is OPEN and does not permit further calls")]
    BreakerOpen { breaker: String },

    #[error("no reachable instance of service '{service}'")]
    NoInstance { service: String },

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("failed to call {service}: {source}")]
    ServiceCall {
        service: String,
        #[source]
        source: Box<CallFault>,
    },
}

impl CallFault {
    /// Wrap a fault with the label of the service being called
    pub fn service_call(service: impl Into<String>, source: CallFault) -> Self {
        CallFault::ServiceCall {
            service: service.into(),
            source: Box::new(source),
        }
    }

    /// Short type name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            CallFault::Connect(_) => "ConnectError",
            CallFault::SocketTimeout(_) => "SocketTimeout",
            CallFault::CallTimeout(_) => "CallTimeout",
            CallFault::Io(_) => "IoError",
            CallFault::UpstreamStatus(_) => "UpstreamStatus",
            CallFault::BreakerOpen { .. } => "CallNotPermitted",
            CallFault::NoInstance { .. } => "NoInstanceAvailable",
            CallFault::InvalidRequest(_) => "InvalidRequest",
            CallFault::ServiceCall { .. } => "ServiceCallError",
        }
    }

    /// `<Kind>: <message>`, the diagnostic carried by degraded responses
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }

    /// True for connectivity faults that never reached an HTTP exchange
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            CallFault::Connect(_)
                | CallFault::SocketTimeout(_)
                | CallFault::CallTimeout(_)
                | CallFault::Io(_)
        )
    }

    /// Upstream status carried by this fault, looking through one wrapper
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            CallFault::UpstreamStatus(response) => Some(response.status),
            CallFault::ServiceCall { source, .. } => source.upstream_status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CallFault {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CallFault::SocketTimeout(e.to_string())
        } else if e.is_connect() {
            CallFault::Connect(e.to_string())
        } else if e.is_builder() {
            CallFault::InvalidRequest(e.to_string())
        } else {
            CallFault::Io(e.to_string())
        }
    }
}
