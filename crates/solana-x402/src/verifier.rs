//! Settlement verification.
//!
//! A [`SettlementVerifier`] strategy looks for evidence that an intent was
//! paid. [`Verifier`] wraps a strategy with the rules every strategy shares:
//! a hard time ceiling, the amount check, and idempotence for references that
//! were already confirmed.
//!
//! Failure policy: anything transient or ambiguous is [`VerificationResult::Pending`];
//! only an explicit rejection is [`VerificationResult::Failed`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::X402Error;
use crate::facilitator_client::FacilitatorVerifier;
use crate::intent::PaymentIntent;
use crate::ledger::LedgerVerifier;
use crate::payment::PaymentSubmission;
use crate::price::format_decimal_amount;
use crate::reference::ReferenceStore;

/// Evidence that an intent was settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub reference: String,
    /// Transaction signature or facilitator settlement id.
    pub settlement_id: String,
    pub verified_at: DateTime<Utc>,
    /// Base units.
    pub amount_paid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    Pending,
    Confirmed(PaymentProof),
    Failed(String),
    /// The strategy cannot tell from what it was given.
    Unknown,
}

impl VerificationResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed(_) => "confirmed",
            Self::Failed(_) => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

/// What a strategy saw, before the shared checks are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// No settlement found yet.
    NotFound,
    Settled { settlement_id: String, amount_paid: u64 },
    /// Explicit, unambiguous rejection.
    Rejected(String),
    /// Nothing to check against (e.g. no in-band payload for a facilitator).
    Undetermined,
}

/// A way of confirming settlement.
///
/// Implementations apply their own per-call timeouts and return
/// `Err(X402Error::Transient)` for network trouble.
pub trait SettlementVerifier: Send + Sync {
    /// Strategy name for logs and metrics.
    fn name(&self) -> &'static str;

    fn observe(
        &self,
        intent: &PaymentIntent,
        submission: Option<&PaymentSubmission>,
    ) -> impl Future<Output = Result<Observation, X402Error>> + Send;
}

/// Strategy picked at startup from configuration.
pub enum ConfiguredVerifier {
    Ledger(LedgerVerifier),
    Facilitator(FacilitatorVerifier),
}

impl ConfiguredVerifier {
    /// Facilitator base URL, if that strategy is in use.
    pub fn facilitator_url(&self) -> Option<&str> {
        match self {
            Self::Ledger(_) => None,
            Self::Facilitator(f) => Some(f.url()),
        }
    }
}

impl SettlementVerifier for ConfiguredVerifier {
    fn name(&self) -> &'static str {
        match self {
            Self::Ledger(v) => v.name(),
            Self::Facilitator(v) => v.name(),
        }
    }

    async fn observe(
        &self,
        intent: &PaymentIntent,
        submission: Option<&PaymentSubmission>,
    ) -> Result<Observation, X402Error> {
        match self {
            Self::Ledger(v) => v.observe(intent, submission).await,
            Self::Facilitator(v) => v.observe(intent, submission).await,
        }
    }
}

/// Applies the shared verification rules around a strategy.
pub struct Verifier<V> {
    strategy: V,
    references: Arc<dyn ReferenceStore>,
    clock: Arc<dyn Clock>,
    ceiling: Duration,
}

impl<V: SettlementVerifier> Verifier<V> {
    /// `ceiling` bounds the whole strategy call, on top of its own timeouts.
    pub fn new(
        strategy: V,
        references: Arc<dyn ReferenceStore>,
        clock: Arc<dyn Clock>,
        ceiling: Duration,
    ) -> Self {
        Self {
            strategy,
            references,
            clock,
            ceiling,
        }
    }

    pub fn strategy(&self) -> &V {
        &self.strategy
    }

    /// Settlement id recorded for a reference confirmed earlier.
    pub fn prior_settlement(&self, reference: &str) -> Option<String> {
        match self.references.confirmed_settlement(reference) {
            Ok(settlement) => settlement,
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "failed to read confirmation state");
                None
            }
        }
    }

    pub async fn verify(
        &self,
        intent: &PaymentIntent,
        submission: Option<&PaymentSubmission>,
    ) -> VerificationResult {
        if let Some(settlement_id) = self.prior_settlement(&intent.reference) {
            tracing::debug!(reference = %intent.reference, "reference already confirmed");
            return VerificationResult::Confirmed(PaymentProof {
                reference: intent.reference.clone(),
                settlement_id,
                verified_at: self.clock.now(),
                amount_paid: intent.amount,
            });
        }

        let observed =
            match tokio::time::timeout(self.ceiling, self.strategy.observe(intent, submission))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        reference = %intent.reference,
                        strategy = self.strategy.name(),
                        ceiling_ms = self.ceiling.as_millis() as u64,
                        "verification exceeded time ceiling"
                    );
                    return VerificationResult::Pending;
                }
            };

        let observation = match observed {
            Ok(o) => o,
            Err(e) => return fold_error(&intent.reference, e),
        };

        match observation {
            Observation::NotFound => VerificationResult::Pending,
            Observation::Undetermined => VerificationResult::Unknown,
            Observation::Rejected(reason) => {
                tracing::info!(reference = %intent.reference, reason = %reason, "payment rejected");
                VerificationResult::Failed(reason)
            }
            Observation::Settled {
                settlement_id,
                amount_paid,
            } => {
                if amount_paid < intent.amount {
                    let decimals = intent.currency.decimals();
                    let reason = format!(
                        "insufficient payment: received {} of {} {}",
                        format_decimal_amount(amount_paid, decimals),
                        intent.display_amount(),
                        intent.currency.code()
                    );
                    tracing::info!(reference = %intent.reference, %reason, "payment rejected");
                    return VerificationResult::Failed(reason);
                }
                if let Err(e) = self
                    .references
                    .mark_confirmed(&intent.reference, &settlement_id)
                {
                    tracing::error!(reference = %intent.reference, error = %e, "failed to record confirmation");
                }
                tracing::info!(
                    reference = %intent.reference,
                    settlement = %settlement_id,
                    amount = amount_paid,
                    strategy = self.strategy.name(),
                    "payment confirmed"
                );
                VerificationResult::Confirmed(PaymentProof {
                    reference: intent.reference.clone(),
                    settlement_id,
                    verified_at: self.clock.now(),
                    amount_paid,
                })
            }
        }
    }
}

fn fold_error(reference: &str, e: X402Error) -> VerificationResult {
    match e {
        X402Error::InvalidProof(reason) => VerificationResult::Failed(reason),
        X402Error::InvalidPayload(reason) => {
            VerificationResult::Failed(format!("malformed payment payload: {reason}"))
        }
        X402Error::NotConfigured(reason) => {
            tracing::error!(reference = %reference, reason = %reason, "verifier not configured");
            VerificationResult::Unknown
        }
        other => {
            tracing::warn!(reference = %reference, error = %other, "verification inconclusive");
            VerificationResult::Pending
        }
    }
}
