use crate::error::CallFault;
use http::StatusCode;

/// Upstream statuses that indicate backend degradation
pub const COUNTABLE_STATUSES: [StatusCode; 3] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::GATEWAY_TIMEOUT,
];

/// True for upstream statuses that count against a service
pub fn is_countable_status(status: StatusCode) -> bool {
    COUNTABLE_STATUSES.contains(&status)
}

/// Decide whether a fault counts against the breaker and the retry budget.
///
/// Transport faults count. Upstream 500, 502 and 504 count. Any other upstream
/// status is the caller's business and does not. A service call wrapper counts
/// only when the fault it wraps is a transport fault.
pub fn classify(fault: &CallFault) -> bool {
    match fault {
        fault if fault.is_transport() => true,
        CallFault::UpstreamStatus(response) => is_countable_status(response.status),
        CallFault::ServiceCall { source, .. } => source.is_transport(),
        _ => false,
    }
}

/// Predicate shape shared by the breaker and retry stages
pub type FailurePredicate = fn(&CallFault) -> bool;
