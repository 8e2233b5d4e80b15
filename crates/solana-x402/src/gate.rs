//! Per-request access decisions.
//!
//! The gate runs once per inbound request:
//! path canonicalization, exempt path, bypass, denial, policy resolution,
//! grant lookup, and then either a payment intent or synchronous verification
//! of the attached proof.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::ResourceCatalog;
use crate::error::X402Error;
use crate::grant_store::GrantStore;
use crate::intent::{IntentBuilder, PaymentIntent};
use crate::payment::{PaymentSubmission, StatusResponse};
use crate::policy::{PolicyResolver, ProtectedResource, Protection};
use crate::price::parse_decimal_amount;
use crate::verifier::{PaymentProof, SettlementVerifier, VerificationResult, Verifier};

pub const MSG_NOT_CONFIRMED: &str = "Payment not yet confirmed.";
pub const MSG_CONFIRMED: &str = "Payment confirmed on blockchain.";
pub const MSG_ALREADY_CONFIRMED: &str = "Payment already confirmed.";
pub const MSG_REFERENCE_NOT_FOUND: &str = "Payment reference not found.";

/// Canonical form of a request path, as a static file server resolves it.
///
/// Percent-escapes are decoded once, empty and `.` segments are dropped and a
/// trailing slash is kept. `..` segments, backslashes and NUL are refused.
pub fn canonical_path(raw: &str) -> Result<String, X402Error> {
    let decoded = urlencoding::decode(raw)
        .map_err(|_| X402Error::InvalidPath(format!("{raw}: not valid UTF-8")))?;
    let mut canonical = String::with_capacity(decoded.len());
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(X402Error::InvalidPath(format!("{raw}: parent segment")));
            }
            s if s.contains(|c: char| c == '\\' || c == '\0') => {
                return Err(X402Error::InvalidPath(format!("{raw}: forbidden character")));
            }
            s => {
                canonical.push('/');
                canonical.push_str(s);
            }
        }
    }
    if canonical.is_empty() || decoded.ends_with('/') {
        canonical.push('/');
    }
    Ok(canonical)
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    /// Holds the bypass permission; never asked to pay.
    pub bypass: bool,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bypass: false,
        }
    }

    pub fn with_bypass(mut self) -> Self {
        self.bypass = true;
        self
    }
}

/// Payment evidence attached to the request.
#[derive(Debug, Clone, PartialEq)]
pub enum InBandProof {
    Absent,
    Submitted(PaymentSubmission),
    /// A payment header was present but could not be decoded.
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowReason {
    Exempt,
    Bypass,
    Unprotected,
    Granted,
    Paid(PaymentProof),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow(AllowReason),
    PaymentRequired {
        intent: PaymentIntent,
        /// Why an attached proof was not accepted.
        reason: Option<String>,
    },
    Denied(String),
    /// Protection is on but payments cannot be taken.
    NotConfigured(String),
    /// Storage failure; the request can be retried.
    Unavailable(String),
    /// The path cannot be mapped to a resource unambiguously.
    InvalidPath(String),
}

impl AccessDecision {
    /// Short outcome name for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow(AllowReason::Exempt) => "exempt",
            Self::Allow(AllowReason::Bypass) => "bypass",
            Self::Allow(AllowReason::Unprotected) => "unprotected",
            Self::Allow(AllowReason::Granted) => "granted",
            Self::Allow(AllowReason::Paid(_)) => "paid",
            Self::PaymentRequired { .. } => "payment_required",
            Self::Denied(_) => "denied",
            Self::NotConfigured(_) => "not_configured",
            Self::Unavailable(_) => "unavailable",
            Self::InvalidPath(_) => "invalid_path",
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

pub struct AccessGate<V> {
    resolver: PolicyResolver,
    catalog: Arc<dyn ResourceCatalog>,
    grants: Arc<dyn GrantStore>,
    intents: IntentBuilder,
    verifier: Verifier<V>,
    grant_ttl: Duration,
    exempt_prefixes: Vec<String>,
    blocked: HashSet<String>,
}

impl<V: SettlementVerifier> AccessGate<V> {
    pub fn new(
        resolver: PolicyResolver,
        catalog: Arc<dyn ResourceCatalog>,
        grants: Arc<dyn GrantStore>,
        intents: IntentBuilder,
        verifier: Verifier<V>,
        grant_ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            catalog,
            grants,
            intents,
            verifier,
            grant_ttl,
            exempt_prefixes: Vec::new(),
            blocked: HashSet::new(),
        }
    }

    /// Paths never subject to policy resolution (the payment routes themselves).
    pub fn with_exempt_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_prefixes = prefixes
            .into_iter()
            .map(|p| p.into().trim_end_matches('/').to_string())
            .collect();
        self
    }

    /// Subjects refused before any policy lookup.
    pub fn with_blocked_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn verifier(&self) -> &Verifier<V> {
        &self.verifier
    }

    pub fn grants(&self) -> &Arc<dyn GrantStore> {
        &self.grants
    }

    pub fn intents(&self) -> &IntentBuilder {
        &self.intents
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    /// Resolve the policy for `resource_id`, folding configuration errors.
    pub fn protection(&self, resource_id: &str) -> Result<Protection, X402Error> {
        let entries = self.catalog.policies_for(resource_id);
        match self.resolver.resolve(resource_id, &entries) {
            Ok(p) => Ok(p),
            Err(X402Error::NotConfigured(m)) => Err(X402Error::NotConfigured(m)),
            Err(e) => {
                tracing::error!(resource = %resource_id, error = %e, "invalid policy configuration");
                Err(X402Error::NotConfigured(e.to_string()))
            }
        }
    }

    pub fn is_blocked(&self, subject: &Subject) -> bool {
        self.blocked.contains(&subject.id)
    }

    /// Intent for a protected resource, for the payment presentation route.
    ///
    /// `Ok(None)` when the resource is not protected. Blocked subjects are
    /// refused before the policy is looked up.
    pub fn payment_intent(
        &self,
        subject: &Subject,
        resource_id: &str,
    ) -> Result<Option<PaymentIntent>, X402Error> {
        if self.is_blocked(subject) {
            tracing::info!(subject = %subject.id, resource = %resource_id, "subject denied");
            return Err(X402Error::AccessDenied(subject.id.clone()));
        }
        let resource_id = canonical_path(resource_id)?;
        match self.protection(&resource_id)? {
            Protection::Unprotected => Ok(None),
            Protection::Protected(resource) => self.intents.issue(&subject.id, &resource).map(Some),
        }
    }

    pub async fn evaluate(&self, path: &str, subject: &Subject, proof: InBandProof) -> AccessDecision {
        let path = match canonical_path(path) {
            Ok(p) => p,
            Err(e) => {
                tracing::info!(subject = %subject.id, error = %e, "rejected request path");
                return AccessDecision::InvalidPath(e.to_string());
            }
        };
        let path = path.as_str();
        if self.is_exempt(path) {
            return AccessDecision::Allow(AllowReason::Exempt);
        }
        if subject.bypass {
            tracing::debug!(subject = %subject.id, path = %path, "payment bypassed");
            return AccessDecision::Allow(AllowReason::Bypass);
        }
        if self.is_blocked(subject) {
            tracing::info!(subject = %subject.id, path = %path, "subject denied");
            return AccessDecision::Denied(X402Error::AccessDenied(subject.id.clone()).to_string());
        }

        let resource = match self.protection(path) {
            Ok(Protection::Unprotected) => return AccessDecision::Allow(AllowReason::Unprotected),
            Ok(Protection::Protected(resource)) => resource,
            Err(e) => return AccessDecision::NotConfigured(e.to_string()),
        };

        if self.grants.has_valid_grant(&subject.id, &resource.id) {
            return AccessDecision::Allow(AllowReason::Granted);
        }

        let intent = match self.intents.issue(&subject.id, &resource) {
            Ok(intent) => intent,
            Err(e) => {
                tracing::error!(resource = %resource.id, error = %e, "failed to issue payment intent");
                return AccessDecision::Unavailable(e.to_string());
            }
        };

        let submission = match proof {
            InBandProof::Absent => {
                return AccessDecision::PaymentRequired {
                    intent,
                    reason: None,
                }
            }
            InBandProof::Malformed(m) => {
                return AccessDecision::PaymentRequired {
                    intent,
                    reason: Some(format!("malformed payment payload: {m}")),
                }
            }
            InBandProof::Submitted(s) => s,
        };

        if let Some(named) = submission.reference() {
            if named != intent.reference {
                if self.grants.has_valid_grant(&subject.id, &resource.id) {
                    return AccessDecision::Allow(AllowReason::Granted);
                }
                tracing::info!(subject = %subject.id, resource = %resource.id, "payment names a foreign reference");
                return AccessDecision::PaymentRequired {
                    intent,
                    reason: Some("payment reference does not match this request".to_string()),
                };
            }
        }

        match self.verifier.verify(&intent, Some(&submission)).await {
            VerificationResult::Confirmed(proof) => {
                self.record_grant(&subject.id, &resource);
                AccessDecision::Allow(AllowReason::Paid(proof))
            }
            VerificationResult::Failed(reason) => AccessDecision::PaymentRequired {
                intent,
                reason: Some(reason),
            },
            VerificationResult::Pending | VerificationResult::Unknown => {
                // A concurrent request may have confirmed and retired the reference.
                if self.grants.has_valid_grant(&subject.id, &resource.id) {
                    return AccessDecision::Allow(AllowReason::Granted);
                }
                AccessDecision::PaymentRequired {
                    intent,
                    reason: Some(MSG_NOT_CONFIRMED.to_string()),
                }
            }
        }
    }

    /// Status check for a reference, as polled by the payment page.
    ///
    /// A fresh confirmation grants access to the subject the reference was
    /// issued to. `expected_amount` is a decimal in the intent's currency; it
    /// can raise, never lower, the amount checked.
    pub async fn check_status(
        &self,
        reference: &str,
        expected_amount: Option<&str>,
    ) -> Result<StatusResponse, X402Error> {
        let record = self
            .intents
            .references()
            .find(reference)?
            .ok_or_else(|| X402Error::ReferenceNotFound(reference.to_string()))?;

        if self.verifier.prior_settlement(reference).is_some() {
            return Ok(StatusResponse::confirmed(MSG_ALREADY_CONFIRMED));
        }

        let expected = match expected_amount.filter(|a| !a.trim().is_empty()) {
            Some(a) => parse_decimal_amount(a, record.currency.decimals())?,
            None => 0,
        };
        let mut intent = self.intents.from_record(&record);
        intent.amount = intent.amount.max(expected);

        Ok(match self.verifier.verify(&intent, None).await {
            VerificationResult::Confirmed(_) => {
                if let Err(e) = self.grants.grant(&record.subject_id, &record.resource_id, self.grant_ttl) {
                    tracing::error!(reference = %reference, error = %e, "failed to store grant");
                }
                StatusResponse::confirmed(MSG_CONFIRMED)
            }
            VerificationResult::Failed(reason) => StatusResponse::error(reason),
            VerificationResult::Pending | VerificationResult::Unknown => {
                StatusResponse::pending(MSG_NOT_CONFIRMED)
            }
        })
    }

    fn record_grant(&self, subject_id: &str, resource: &ProtectedResource) {
        match self.grants.grant(subject_id, &resource.id, self.grant_ttl) {
            Ok(grant) => tracing::info!(
                subject = %subject_id,
                resource = %resource.id,
                expires_at = %grant.expires_at,
                "access granted"
            ),
            Err(e) => tracing::error!(subject = %subject_id, resource = %resource.id, error = %e, "failed to store grant"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_path_merges_and_decodes_segments() {
        assert_eq!(canonical_path("/premium/a.html").unwrap(), "/premium/a.html");
        assert_eq!(canonical_path("//premium///a.html").unwrap(), "/premium/a.html");
        assert_eq!(canonical_path("/premium/./a.html").unwrap(), "/premium/a.html");
        assert_eq!(canonical_path("/%70remium%2Fa.html").unwrap(), "/premium/a.html");
        assert_eq!(canonical_path("/premium//").unwrap(), "/premium/");
        assert_eq!(canonical_path("").unwrap(), "/");
        assert_eq!(canonical_path("//").unwrap(), "/");
    }

    #[test]
    fn canonical_path_refuses_traversal() {
        for raw in [
            "/x402/../premium/a.html",
            "/x402/%2e%2e/premium/a.html",
            "/premium/..",
            "/premium\\a.html",
            "/premium/%00",
            "/premium/%ff",
        ] {
            assert!(
                matches!(canonical_path(raw), Err(X402Error::InvalidPath(_))),
                "{raw}"
            );
        }
        // Decoded once, like the file server does.
        assert_eq!(canonical_path("/%252e%252e/a").unwrap(), "/%2e%2e/a");
    }
}
