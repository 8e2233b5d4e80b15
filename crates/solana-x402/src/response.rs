use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::X402Error;

/// Response from the facilitator's `/verify` endpoint.
///
/// Facilitators that answer a bare `200` with no body are treated as valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    #[serde(default = "valid_by_default")]
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Transaction signature of the settlement, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    /// Amount the facilitator saw transferred, in base units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

fn valid_by_default() -> bool {
    true
}

/// Settlement receipt returned in the `X-PAYMENT-RESPONSE` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub success: bool,
    pub settlement_id: String,
    pub reference: String,
}

impl PaymentResponse {
    /// Base64 JSON, with `.<hmac>` appended when a secret is given.
    pub fn to_header(&self, secret: Option<&[u8]>) -> Result<String, X402Error> {
        let json = serde_json::to_vec(self)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&json);
        Ok(match secret {
            Some(secret) => format!("{encoded}.{}", crate::hmac::sign_body(secret, &json)),
            None => encoded,
        })
    }

    /// Parse a header produced by [`PaymentResponse::to_header`].
    ///
    /// When `secret` is given the signature must be present and valid.
    pub fn from_header(value: &str, secret: Option<&[u8]>) -> Result<Self, X402Error> {
        let (encoded, signature) = match value.split_once('.') {
            Some((e, s)) => (e, Some(s)),
            None => (value, None),
        };
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| X402Error::InvalidPayload(format!("invalid base64: {e}")))?;
        if let Some(secret) = secret {
            let valid = signature
                .map(|sig| crate::hmac::verify_body(secret, &json, sig))
                .unwrap_or(false);
            if !valid {
                return Err(X402Error::InvalidPayload(
                    "payment response signature mismatch".to_string(),
                ));
            }
        }
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt() -> PaymentResponse {
        PaymentResponse {
            success: true,
            settlement_id: "5sig".to_string(),
            reference: "ref".to_string(),
        }
    }

    #[test]
    fn signed_header_requires_matching_secret() {
        let header = receipt().to_header(Some(b"s3cret")).unwrap();
        assert!(header.contains('.'));
        assert_eq!(
            PaymentResponse::from_header(&header, Some(b"s3cret")).unwrap(),
            receipt()
        );
        assert!(PaymentResponse::from_header(&header, Some(b"other")).is_err());
    }

    #[test]
    fn unsigned_header_is_plain_base64() {
        let header = receipt().to_header(None).unwrap();
        assert!(!header.contains('.'));
        assert!(PaymentResponse::from_header(&header, Some(b"s3cret")).is_err());
        assert_eq!(PaymentResponse::from_header(&header, None).unwrap(), receipt());
    }

    #[test]
    fn bare_verify_response_is_valid() {
        let r: VerifyResponse = serde_json::from_str("{}").unwrap();
        assert!(r.is_valid);
        let r: VerifyResponse =
            serde_json::from_str(r#"{"isValid":false,"invalidReason":"wrong amount"}"#).unwrap();
        assert!(!r.is_valid);
        assert_eq!(r.invalid_reason.as_deref(), Some("wrong amount"));
    }
}
