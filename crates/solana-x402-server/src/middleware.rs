//! The payment gate as actix middleware.
//!
//! Every request passes through [`payment_gate`]: the subject is identified,
//! any in-band payment header is decoded, and the [`AccessGate`] decides.
//! Allowed requests reach the wrapped service unchanged.
//!
//! [`AccessGate`]: x402::AccessGate

use std::time::Instant;

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::middleware::Next;
use actix_web::{web, Error, HttpMessage, HttpResponse, ResponseError};
use x402::gate::MSG_NOT_CONFIRMED;
use x402::{
    AccessDecision, AllowReason, InBandProof, PaymentIntent, PaymentProof, PaymentRequiredBody,
    PaymentResponse, PaymentSubmission, SettlementVerifier, LEGACY_PAYMENT_HEADER,
    PAYMENT_HEADER, PAYMENT_REQUIRED_HEADER,
};

use crate::config::ResponseMode;
use crate::error::ServerError;
use crate::metrics;
use crate::session;
use crate::state::AppState;

/// Presentation route unpaid requests are sent to in redirect mode.
pub const PAY_ROUTE: &str = "/x402/pay";

/// Decode the payment header, preferring `X-PAYMENT` over the legacy name.
pub fn extract_proof(headers: &HeaderMap) -> InBandProof {
    let (value, legacy) = match headers.get(PAYMENT_HEADER) {
        Some(v) => (v, false),
        None => match headers.get(LEGACY_PAYMENT_HEADER) {
            Some(v) => (v, true),
            None => return InBandProof::Absent,
        },
    };
    let Ok(value) = value.to_str() else {
        return InBandProof::Malformed("header is not valid ASCII".to_string());
    };
    let decoded = if legacy {
        PaymentSubmission::from_legacy(value)
    } else {
        PaymentSubmission::decode(value)
    };
    match decoded {
        Ok(submission) => InBandProof::Submitted(submission),
        Err(e) => InBandProof::Malformed(e.to_string()),
    }
}

fn no_store() -> (HeaderName, HeaderValue) {
    (header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
}

/// 402 with a JSON payment description, or a redirect to the pay route.
pub fn payment_required_response(
    state: &AppState,
    path: &str,
    intent: &PaymentIntent,
    reason: Option<String>,
) -> HttpResponse {
    match state.config.response_mode {
        ResponseMode::Status => {
            let body = PaymentRequiredBody::new(
                intent,
                state.facilitator_url(),
                state.clock.now(),
                reason,
            );
            HttpResponse::PaymentRequired()
                .insert_header(no_store())
                .content_type("application/json")
                .json(body)
        }
        ResponseMode::Redirect => HttpResponse::Found()
            .insert_header(no_store())
            .insert_header((header::LOCATION, pay_location(path)))
            .insert_header((PAYMENT_REQUIRED_HEADER, "true"))
            .finish(),
    }
}

pub fn pay_location(resource: &str) -> String {
    format!("{PAY_ROUTE}?resource={}", urlencoding::encode(resource))
}

fn receipt_header(state: &AppState, proof: &PaymentProof) -> Option<HeaderValue> {
    let receipt = PaymentResponse {
        success: true,
        settlement_id: proof.settlement_id.clone(),
        reference: proof.reference.clone(),
    };
    match receipt.to_header(state.config.hmac_secret.as_deref()) {
        Ok(value) => HeaderValue::from_str(&value).ok(),
        Err(e) => {
            tracing::warn!(reference = %proof.reference, error = %e, "failed to encode payment receipt");
            None
        }
    }
}

fn verification_result(decision: &AccessDecision) -> &'static str {
    match decision {
        AccessDecision::Allow(AllowReason::Paid(_)) => "confirmed",
        AccessDecision::PaymentRequired {
            reason: Some(reason),
            ..
        } if reason != MSG_NOT_CONFIRMED => "failed",
        AccessDecision::PaymentRequired { .. } => "pending",
        _ => "skipped",
    }
}

/// Gate middleware; install with `actix_web::middleware::from_fn(payment_gate)`.
///
/// Requires `web::Data<AppState>` on the app. Without it requests pass
/// through ungated.
pub async fn payment_gate(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let Some(state) = req.app_data::<web::Data<AppState>>().cloned() else {
        tracing::error!("payment gate installed without AppState; request not gated");
        return Ok(next.call(req).await?.map_into_left_body());
    };

    let (subject, new_session) =
        session::resolve_subject(req.request(), state.config.admin_token.as_deref());
    req.extensions_mut().insert(subject.clone());

    let path = req.path().to_string();
    let proof = extract_proof(req.headers());
    let verifying = matches!(proof, InBandProof::Submitted(_));

    let started = Instant::now();
    let decision = state.gate.evaluate(&path, &subject, proof).await;
    metrics::GATE_DECISIONS
        .with_label_values(&[decision.label()])
        .inc();
    if verifying {
        let result = verification_result(&decision);
        if result != "skipped" {
            metrics::record_verification(
                state.gate.verifier().strategy().name(),
                result,
                started.elapsed().as_secs_f64(),
            );
        }
    }
    tracing::debug!(path = %path, subject = %subject.id, outcome = decision.label(), "gate decision");

    let mut res = match decision {
        AccessDecision::Allow(reason) => {
            let receipt = match &reason {
                AllowReason::Paid(proof) => {
                    metrics::GRANTS_ISSUED.inc();
                    receipt_header(&state, proof)
                }
                _ => None,
            };
            let mut res = next.call(req).await?;
            if let Some(value) = receipt {
                res.headers_mut()
                    .insert(HeaderName::from_static("x-payment-response"), value);
            }
            res.map_into_left_body()
        }
        AccessDecision::PaymentRequired { intent, reason } => {
            if let Some(ref reason) = reason {
                tracing::info!(path = %path, reference = %intent.reference, reason = %reason, "payment not accepted");
            }
            let resp = payment_required_response(&state, &path, &intent, reason);
            req.into_response(resp).map_into_right_body()
        }
        AccessDecision::Denied(msg) => {
            let resp = ServerError::Forbidden(msg).error_response();
            req.into_response(resp).map_into_right_body()
        }
        AccessDecision::NotConfigured(msg) => {
            let resp = ServerError::NotConfigured(msg).error_response();
            req.into_response(resp).map_into_right_body()
        }
        AccessDecision::Unavailable(msg) => {
            let resp = ServerError::Unavailable(msg).error_response();
            req.into_response(resp).map_into_right_body()
        }
        AccessDecision::InvalidPath(msg) => {
            let resp = ServerError::BadRequest(msg).error_response();
            req.into_response(resp).map_into_right_body()
        }
    };

    if let Some(cookie) = new_session {
        if let Err(e) = res.response_mut().add_cookie(&cookie) {
            tracing::warn!(error = %e, "failed to set session cookie");
        }
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_extract_proof_prefers_x_payment() {
        let req = TestRequest::default()
            .insert_header((PAYMENT_HEADER, r#"{"reference":"ref-a","payload":{}}"#))
            .insert_header((LEGACY_PAYMENT_HEADER, "legacy-token"))
            .to_http_request();
        match extract_proof(req.headers()) {
            InBandProof::Submitted(s) => assert_eq!(s.reference(), Some("ref-a")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_extract_proof_legacy_and_malformed() {
        let legacy = TestRequest::default()
            .insert_header((LEGACY_PAYMENT_HEADER, "opaque-token"))
            .to_http_request();
        assert!(matches!(
            extract_proof(legacy.headers()),
            InBandProof::Submitted(_)
        ));

        let malformed = TestRequest::default()
            .insert_header((PAYMENT_HEADER, "!!not base64!!"))
            .to_http_request();
        assert!(matches!(
            extract_proof(malformed.headers()),
            InBandProof::Malformed(_)
        ));

        let none = TestRequest::default().to_http_request();
        assert_eq!(extract_proof(none.headers()), InBandProof::Absent);
    }

    #[test]
    fn test_pay_location_encodes_resource() {
        assert_eq!(
            pay_location("/premium/a b"),
            "/x402/pay?resource=%2Fpremium%2Fa%20b"
        );
    }
}
