//! HTTP client for a remote facilitator's `/verify` endpoint.
//!
//! The facilitator receives the in-band payment payload together with the
//! requirements it must satisfy, and answers whether the payment is valid.

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::constants::X402_VERSION;
use crate::error::X402Error;
use crate::intent::PaymentIntent;
use crate::payment::{PaymentRequirements, PaymentSubmission};
use crate::response::VerifyResponse;
use crate::verifier::{Observation, SettlementVerifier};

/// Header carrying the HMAC of the request body.
pub const FACILITATOR_AUTH_HEADER: &str = "X-Facilitator-Auth";

/// Delegates verification to a facilitator service.
pub struct FacilitatorVerifier {
    http: reqwest::Client,
    url: String,
    hmac_secret: Option<Vec<u8>>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl FacilitatorVerifier {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            hmac_secret: None,
            timeout,
            clock,
        }
    }

    /// Sign request bodies with a shared secret.
    pub fn with_hmac_secret(mut self, secret: Vec<u8>) -> Self {
        self.hmac_secret = Some(secret);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the submission to `{url}/verify` and return the parsed answer.
    ///
    /// A refusing 4xx is folded into an invalid [`VerifyResponse`]; outages
    /// and auth problems are `Err(Transient)`.
    pub async fn call_verify(
        &self,
        submission: &PaymentSubmission,
        requirements: &PaymentRequirements,
    ) -> Result<VerifyResponse, X402Error> {
        let url = format!("{}/verify", self.url);
        let body = serde_json::json!({
            "x402Version": X402_VERSION,
            "paymentPayload": submission,
            "paymentRequirements": requirements,
        });
        let body_bytes = serde_json::to_vec(&body)?;

        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .timeout(self.timeout);

        if let Some(secret) = &self.hmac_secret {
            request = request.header(
                FACILITATOR_AUTH_HEADER,
                crate::hmac::sign_body(secret, &body_bytes),
            );
        }

        let resp = request
            .body(body_bytes)
            .send()
            .await
            .map_err(|e| X402Error::Transient(format!("facilitator request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            tracing::error!(%status, "facilitator rejected our credentials");
            return Err(X402Error::Transient(
                "facilitator authentication failed".to_string(),
            ));
        }
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::NOT_FOUND
        {
            return Err(X402Error::Transient(format!(
                "facilitator unavailable (HTTP {status})"
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| X402Error::Transient(format!("facilitator response read failed: {e}")))?;

        if status.is_success() {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(serde_json::from_str("{}")?);
            }
            return serde_json::from_slice(&bytes).map_err(|e| {
                X402Error::Transient(format!("facilitator response parse failed: {e}"))
            });
        }

        // Remaining 4xx: an explicit refusal.
        let reason = serde_json::from_slice::<VerifyResponse>(&bytes)
            .ok()
            .and_then(|r| r.invalid_reason)
            .unwrap_or_else(|| format!("payment rejected by facilitator (HTTP {status})"));
        Ok(VerifyResponse {
            is_valid: false,
            invalid_reason: Some(reason),
            payer: None,
            transaction: None,
            amount: None,
        })
    }
}

impl SettlementVerifier for FacilitatorVerifier {
    fn name(&self) -> &'static str {
        "facilitator"
    }

    async fn observe(
        &self,
        intent: &PaymentIntent,
        submission: Option<&PaymentSubmission>,
    ) -> Result<Observation, X402Error> {
        let Some(submission) = submission else {
            return Ok(Observation::Undetermined);
        };
        let requirements = PaymentRequirements::for_intent(intent, self.clock.now());
        let verdict = self.call_verify(submission, &requirements).await?;

        if !verdict.is_valid {
            return Ok(Observation::Rejected(verdict.invalid_reason.unwrap_or_else(
                || "payment rejected by facilitator".to_string(),
            )));
        }

        let amount_paid = match verdict.amount.as_deref() {
            Some(a) => a.parse::<u64>().map_err(|_| {
                X402Error::Transient(format!("facilitator reported unreadable amount '{a}'"))
            })?,
            None => intent.amount,
        };
        let settlement_id = verdict
            .transaction
            .or_else(|| submission.signature().map(String::from))
            .unwrap_or_else(|| intent.reference.clone());

        Ok(Observation::Settled {
            settlement_id,
            amount_paid,
        })
    }
}
