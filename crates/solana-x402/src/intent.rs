//! Canonical payment intents.
//!
//! An intent is rebuilt from its stored reference on every render, so the
//! same wallet request (and QR code) is shown until the intent expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{to_chrono, Clock};
use crate::constants::SOLANA_PAY_SCHEME;
use crate::error::X402Error;
use crate::policy::ProtectedResource;
use crate::price::{format_decimal_amount, Currency};
use crate::reference::{generate_reference, ReferenceRecord, ReferenceStore};

/// The canonical description of a requested payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub reference: String,
    /// Base units.
    pub amount: u64,
    pub currency: Currency,
    pub recipient: String,
    pub resource_id: String,
    pub label: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Decimal amount as shown to payers.
    pub fn display_amount(&self) -> String {
        format_decimal_amount(self.amount, self.currency.decimals())
    }

    /// Solana Pay transfer request URI.
    ///
    /// Field order is fixed: recipient, amount, spl-token, reference, label, message.
    pub fn to_uri(&self) -> String {
        let mut uri = format!(
            "{SOLANA_PAY_SCHEME}:{}?amount={}",
            self.recipient,
            self.display_amount()
        );
        if let Some(mint) = self.currency.mint() {
            uri.push_str("&spl-token=");
            uri.push_str(mint);
        }
        uri.push_str("&reference=");
        uri.push_str(&self.reference);
        uri.push_str("&label=");
        uri.push_str(&urlencoding::encode(&self.label));
        uri.push_str("&message=");
        uri.push_str(&urlencoding::encode(&self.message));
        uri
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Builds intents and owns the reference lifecycle.
pub struct IntentBuilder {
    references: Arc<dyn ReferenceStore>,
    clock: Arc<dyn Clock>,
    intent_ttl: Duration,
    label: String,
}

impl IntentBuilder {
    pub fn new(
        references: Arc<dyn ReferenceStore>,
        clock: Arc<dyn Clock>,
        intent_ttl: Duration,
        label: impl Into<String>,
    ) -> Self {
        Self {
            references,
            clock,
            intent_ttl,
            label: label.into(),
        }
    }

    pub fn references(&self) -> &Arc<dyn ReferenceStore> {
        &self.references
    }

    /// Return the intent for `subject` paying for `resource`.
    ///
    /// Reuses the live stored reference for the pair, or generates and
    /// persists a new one before returning.
    pub fn issue(
        &self,
        subject_id: &str,
        resource: &ProtectedResource,
    ) -> Result<PaymentIntent, X402Error> {
        let now = self.clock.now();
        let candidate = ReferenceRecord {
            reference: generate_reference(),
            subject_id: subject_id.to_string(),
            resource_id: resource.id.clone(),
            amount: resource.price.amount,
            currency: resource.price.currency.clone(),
            recipient: resource.recipient_address.clone(),
            created_at: now,
            expires_at: now + to_chrono(self.intent_ttl),
        };
        let fresh = candidate.reference.clone();
        let stored = self.references.get_or_insert(candidate, now)?;
        if stored.reference == fresh {
            tracing::info!(
                reference = %stored.reference,
                subject = %subject_id,
                resource = %resource.id,
                "issued payment reference"
            );
        } else {
            tracing::debug!(reference = %stored.reference, "reusing payment reference");
        }
        Ok(self.compose(resource, &stored))
    }

    /// Rebuild an intent from a stored record and the resource's current price.
    ///
    /// Pure: identical inputs give identical output.
    pub fn compose(&self, resource: &ProtectedResource, stored: &ReferenceRecord) -> PaymentIntent {
        let subject_label = resource.label.as_deref().unwrap_or(&resource.id);
        PaymentIntent {
            reference: stored.reference.clone(),
            amount: resource.price.amount,
            currency: resource.price.currency.clone(),
            recipient: resource.recipient_address.clone(),
            resource_id: resource.id.clone(),
            label: self.label.clone(),
            message: format!("Payment for {subject_label}"),
            created_at: stored.created_at,
            expires_at: stored.expires_at,
        }
    }

    /// Rebuild the intent a stored record describes, using its own price fields.
    pub fn from_record(&self, record: &ReferenceRecord) -> PaymentIntent {
        PaymentIntent {
            reference: record.reference.clone(),
            amount: record.amount,
            currency: record.currency.clone(),
            recipient: record.recipient.clone(),
            resource_id: record.resource_id.clone(),
            label: self.label.clone(),
            message: format!("Payment for {}", record.resource_id),
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}
