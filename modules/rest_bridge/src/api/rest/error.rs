use axum::response::{IntoResponse, Response};
use http::StatusCode;
use surkit::BrokerError;

use crate::domain::error::DomainError;

/// Status code and client-safe text for a domain error. Full detail stays in
/// the logs.
pub fn domain_error_to_status(err: &DomainError) -> (StatusCode, &'static str) {
    match err {
        DomainError::MissingTopic => (StatusCode::BAD_REQUEST, "Invalid URL path: missing topic"),
        DomainError::InvalidTopic { .. } => (StatusCode::BAD_REQUEST, "Invalid URL path: bad topic"),
        DomainError::UnreadableBody { .. } => (StatusCode::BAD_REQUEST, "Error reading request body"),
        DomainError::InvalidJson { .. } => (StatusCode::BAD_REQUEST, "Invalid JSON in request body"),
        DomainError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "Request to broker timed out"),
        DomainError::Broker { source, .. } => {
            let text = match source {
                BrokerError::NoResponders(_) => "no responders available for request",
                BrokerError::ConnectionClosed => "broker connection closed",
                _ => "broker request failed",
            };
            (StatusCode::INTERNAL_SERVER_ERROR, text)
        }
    }
}

impl IntoResponse for DomainError {
    fn into_response(self) -> Response {
        domain_error_to_status(&self).into_response()
    }
}
