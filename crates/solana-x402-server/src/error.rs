use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use x402::gate::MSG_REFERENCE_NOT_FOUND;
use x402::X402Error;

#[derive(Debug)]
pub enum ServerError {
    /// Payments cannot be taken for this resource
    NotConfigured(String),
    /// Status check for a reference that was never issued
    ReferenceNotFound(String),
    /// Malformed query or header
    BadRequest(String),
    /// Subject refused before policy resolution
    Forbidden(String),
    /// Storage or upstream failure; retryable
    Unavailable(String),
    /// Internal error
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::NotConfigured(msg) => write!(f, "payments not configured: {}", msg),
            ServerError::ReferenceNotFound(r) => write!(f, "payment reference not found: {}", r),
            ServerError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ServerError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            ServerError::Unavailable(msg) => write!(f, "service unavailable: {}", msg),
            ServerError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<X402Error> for ServerError {
    fn from(e: X402Error) -> Self {
        match e {
            X402Error::NotConfigured(msg) => ServerError::NotConfigured(msg),
            X402Error::ReferenceNotFound(r) => ServerError::ReferenceNotFound(r),
            X402Error::AccessDenied(s) => ServerError::Forbidden(s),
            X402Error::InvalidPrice(_)
            | X402Error::InvalidAddress(_)
            | X402Error::InvalidPayload(_)
            | X402Error::InvalidPath(_)
            | X402Error::InvalidProof(_) => ServerError::BadRequest(e.to_string()),
            X402Error::Storage(_) | X402Error::Transient(_) => {
                ServerError::Unavailable(e.to_string())
            }
            X402Error::SerdeError(_) => ServerError::Internal(e.to_string()),
        }
    }
}

impl ResponseError for ServerError {
    fn error_response(&self) -> HttpResponse {
        match self {
            ServerError::NotConfigured(msg) => {
                tracing::warn!("Payments not configured: {}", msg);
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "error": "not_configured",
                    "message": "Payments are not configured for this resource"
                }))
            }
            // The status poller reads `status`/`message` from this body.
            ServerError::ReferenceNotFound(_) => HttpResponse::NotFound().json(serde_json::json!({
                "error": "reference_not_found",
                "status": "error",
                "message": MSG_REFERENCE_NOT_FOUND
            })),
            ServerError::BadRequest(msg) => HttpResponse::BadRequest().json(serde_json::json!({
                "error": "bad_request",
                "message": msg
            })),
            ServerError::Forbidden(_) => HttpResponse::Forbidden().json(serde_json::json!({
                "error": "forbidden",
                "message": "Access denied"
            })),
            ServerError::Unavailable(msg) => {
                tracing::error!("Service unavailable: {}", msg);
                HttpResponse::ServiceUnavailable().json(serde_json::json!({
                    "error": "unavailable",
                    "message": "Temporarily unavailable, please retry"
                }))
            }
            ServerError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": "internal_error",
                    "message": "An internal error occurred"
                }))
            }
        }
    }
}
