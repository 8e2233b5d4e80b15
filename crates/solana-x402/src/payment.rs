use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{SOLANA_NETWORK, SOLANA_PAY_SCHEME, X402_VERSION};
use crate::error::X402Error;
use crate::intent::PaymentIntent;

fn default_version() -> u32 {
    X402_VERSION
}

/// In-band payment payload a client attaches to a retried request.
///
/// Sent base64-encoded in `X-PAYMENT`, or as raw JSON (or an opaque token)
/// in the legacy `X402-Payment` header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSubmission {
    #[serde(default = "default_version")]
    pub x402_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Scheme-specific proof, forwarded verbatim to a facilitator.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Transaction signature, when the payer already knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl PaymentSubmission {
    /// Reference named by the submission, top-level or inside `payload`.
    pub fn reference(&self) -> Option<&str> {
        self.reference
            .as_deref()
            .or_else(|| self.payload.get("reference").and_then(|v| v.as_str()))
    }

    /// Transaction signature named by the submission, top-level or inside `payload`.
    pub fn signature(&self) -> Option<&str> {
        self.signature
            .as_deref()
            .or_else(|| self.payload.get("signature").and_then(|v| v.as_str()))
    }

    /// Parse an `X-PAYMENT` header value: base64 JSON, or raw JSON.
    pub fn decode(value: &str) -> Result<Self, X402Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(X402Error::InvalidPayload("empty payment header".to_string()));
        }
        if value.starts_with('{') {
            return Ok(serde_json::from_str(value)?);
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|e| X402Error::InvalidPayload(format!("invalid base64: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Parse a legacy `X402-Payment` header value.
    ///
    /// JSON is parsed as a full submission; anything else is an opaque token
    /// carried as the payload.
    pub fn from_legacy(value: &str) -> Result<Self, X402Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(X402Error::InvalidPayload("empty payment header".to_string()));
        }
        if let Ok(submission) = serde_json::from_str::<Self>(value) {
            if submission.payload.is_object() || submission.reference.is_some() {
                return Ok(submission);
            }
        }
        Ok(Self {
            x402_version: X402_VERSION,
            scheme: None,
            network: None,
            payload: serde_json::Value::String(value.to_string()),
            reference: None,
            signature: None,
        })
    }

    /// Base64 encoding for the `X-PAYMENT` header.
    pub fn encode(&self) -> Result<String, X402Error> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }
}

/// What a facilitator is asked to check a submission against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Required amount in base units.
    pub amount: String,
    /// Decimal amount as displayed.
    pub price: String,
    /// `SOL` or the SPL mint address.
    pub asset: String,
    pub pay_to: String,
    pub reference: String,
    pub resource: String,
    pub max_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PaymentRequirements {
    pub fn for_intent(intent: &PaymentIntent, now: DateTime<Utc>) -> Self {
        let remaining = (intent.expires_at - now).num_seconds().max(0) as u64;
        Self {
            scheme: SOLANA_PAY_SCHEME.to_string(),
            network: SOLANA_NETWORK.to_string(),
            amount: intent.amount.to_string(),
            price: intent.display_amount(),
            asset: intent
                .currency
                .mint()
                .unwrap_or(intent.currency.code())
                .to_string(),
            pay_to: intent.recipient.clone(),
            reference: intent.reference.clone(),
            resource: intent.resource_id.clone(),
            max_timeout_seconds: remaining,
            description: Some(intent.message.clone()),
        }
    }
}

/// Body of a 402 Payment Required response.
///
/// The leading fields are the flat shape wallets and browser scripts read;
/// `accepts` carries the same data in x402 requirements form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    /// Decimal amount.
    pub amount: String,
    pub currency: String,
    pub network: String,
    pub recipient: String,
    pub facilitator: Option<String>,
    pub description: String,
    pub reference: String,
    pub payment_url: String,
    pub expires_at: DateTime<Utc>,
    pub x402_version: u32,
    pub accepts: Vec<PaymentRequirements>,
    /// Why an attached proof was not accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentRequiredBody {
    pub fn new(
        intent: &PaymentIntent,
        facilitator: Option<&str>,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        Self {
            amount: intent.display_amount(),
            currency: intent.currency.code().to_string(),
            network: SOLANA_NETWORK.to_string(),
            recipient: intent.recipient.clone(),
            facilitator: facilitator.map(String::from),
            description: "Premium content access".to_string(),
            reference: intent.reference.clone(),
            payment_url: intent.to_uri(),
            expires_at: intent.expires_at,
            x402_version: X402_VERSION,
            accepts: vec![PaymentRequirements::for_intent(intent, now)],
            error,
        }
    }
}

/// Status reported to polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Confirmed,
    Pending,
    Error,
}

/// Body of the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: PaymentStatus,
    pub message: String,
}

impl StatusResponse {
    pub fn confirmed(message: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Confirmed,
            message: message.into(),
        }
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Pending,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Error,
            message: message.into(),
        }
    }
}
