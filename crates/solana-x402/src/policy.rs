//! Policy resolution: is a resource protected, and at what price?
//!
//! A resource may carry several policy entries. Each entry is either
//! [`PolicyMode::Global`] (price and recipient come from the shared
//! [`GlobalPolicy`]) or [`PolicyMode::Individual`] (the entry carries its own).
//! The first enabled entry in iteration order is authoritative.

use serde::{Deserialize, Serialize};

use crate::error::X402Error;
use crate::price::{Currency, Price};

/// Where an entry's price and recipient come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum PolicyMode {
    Global,
    Individual {
        /// Decimal price in `currency` (e.g. "0.05"). Non-positive disables payment.
        price: String,
        #[serde(default)]
        currency: Option<Currency>,
        /// Base58 recipient; falls back to the global recipient when absent.
        #[serde(default)]
        recipient: Option<String>,
    },
}

/// One protection configuration attached to a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEntry {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub mode: PolicyMode,
    /// Human label used in the payment message.
    #[serde(default)]
    pub label: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl PolicyEntry {
    pub fn global() -> Self {
        Self {
            enabled: true,
            mode: PolicyMode::Global,
            label: None,
        }
    }

    pub fn individual(price: &str, recipient: Option<&str>) -> Self {
        Self {
            enabled: true,
            mode: PolicyMode::Individual {
                price: price.to_string(),
                currency: None,
                recipient: recipient.map(String::from),
            },
            label: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }
}

/// Site-wide settings shared by every [`PolicyMode::Global`] entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalPolicy {
    pub price: Price,
    /// Merchant address. `None` means payments are not configured.
    pub recipient: Option<String>,
}

/// Configuration mode a resolved resource came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedMode {
    Global,
    Individual,
}

/// A resource that requires payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedResource {
    pub id: String,
    pub price: Price,
    pub recipient_address: String,
    pub mode: ResolvedMode,
    pub enabled: bool,
    pub label: Option<String>,
}

/// Outcome of policy resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protection {
    Unprotected,
    Protected(ProtectedResource),
}

/// Resolves policy entries against the global policy.
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    global: GlobalPolicy,
}

impl PolicyResolver {
    pub fn new(global: GlobalPolicy) -> Self {
        Self { global }
    }

    pub fn global(&self) -> &GlobalPolicy {
        &self.global
    }

    /// Resolve `entries` for `resource_id`.
    ///
    /// Returns `Err(NotConfigured)` when the authoritative entry is payable but
    /// has no recipient; an unparseable individual price is `InvalidPrice`.
    pub fn resolve(
        &self,
        resource_id: &str,
        entries: &[PolicyEntry],
    ) -> Result<Protection, X402Error> {
        let Some(entry) = entries.iter().find(|e| e.enabled) else {
            return Ok(Protection::Unprotected);
        };

        let (price, recipient, mode) = match &entry.mode {
            PolicyMode::Global => (
                self.global.price.clone(),
                self.global.recipient.clone(),
                ResolvedMode::Global,
            ),
            PolicyMode::Individual {
                price,
                currency,
                recipient,
            } => {
                let currency = currency
                    .clone()
                    .unwrap_or_else(|| self.global.price.currency.clone());
                (
                    Price::parse(price, currency)?,
                    recipient.clone().or_else(|| self.global.recipient.clone()),
                    ResolvedMode::Individual,
                )
            }
        };

        if !price.is_payable() {
            tracing::debug!(resource = %resource_id, "non-positive price, treating as unprotected");
            return Ok(Protection::Unprotected);
        }

        let recipient = recipient.filter(|r| !r.trim().is_empty()).ok_or_else(|| {
            X402Error::NotConfigured("no recipient address configured".to_string())
        })?;
        crate::reference::validate_address(&recipient)?;

        Ok(Protection::Protected(ProtectedResource {
            id: resource_id.to_string(),
            price,
            recipient_address: recipient,
            mode,
            enabled: true,
            label: entry.label.clone(),
        }))
    }
}

/// Glob patterns marking request paths as protected under the global policy.
#[derive(Debug, Clone, Default)]
pub struct ProtectedPaths {
    patterns: Vec<glob::Pattern>,
}

impl ProtectedPaths {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, X402Error> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p.as_ref()).map_err(|e| {
                    X402Error::NotConfigured(format!("invalid path pattern '{}': {e}", p.as_ref()))
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
