//! CORS configuration for the payment gate.

use actix_cors::Cors;
use actix_web::http::header::{self, HeaderName};

/// Build the CORS middleware from allowed origins.
///
/// `*` admits any origin.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin_str = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == "*" || a == origin_str)
        })
        .allowed_methods(vec!["GET", "HEAD", "OPTIONS"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-payment"),
            HeaderName::from_static("x402-payment"),
            HeaderName::from_static("x-x402-session"),
        ])
        .expose_headers(vec![
            HeaderName::from_static("x-payment-response"),
            HeaderName::from_static("x-payment-required"),
        ])
        .supports_credentials()
        .max_age(3600)
}
