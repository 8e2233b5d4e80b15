//! x402 payment gate for Solana Pay.
//!
//! Decides whether a request needs payment, issues a canonical payment intent,
//! verifies settlement against the Solana ledger or a delegated facilitator,
//! and grants time-scoped access.
//!
//! # Components
//!
//! - [`PolicyResolver`]: is a resource protected, and at what price
//! - [`IntentBuilder`]: deterministic payment intents and Solana Pay URIs
//! - [`Verifier`]: settlement checks via [`LedgerVerifier`] or [`FacilitatorVerifier`]
//! - [`GrantStore`]: access grants per (subject, resource)
//! - [`AccessGate`]: the per-request decision
//! - [`StatusPoller`]: bounded client-side status polling
//!
//! # Quick example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use x402::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), X402Error> {
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let references: Arc<dyn ReferenceStore> = Arc::new(InMemoryReferenceStore::new());
//! let resolver = PolicyResolver::new(GlobalPolicy {
//!     price: Price::parse("0.01", Currency::Sol)?,
//!     recipient: Some("9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin".into()),
//! });
//! let ledger = LedgerVerifier::new(
//!     reqwest::Client::new(),
//!     default_rpc_endpoints(),
//!     "mainnet-beta",
//!     DEFAULT_VERIFY_TIMEOUT,
//! )?;
//! let gate = AccessGate::new(
//!     resolver,
//!     Arc::new(StaticCatalog::new(ProtectedPaths::new(&["/premium/*"])?)),
//!     Arc::new(InMemoryGrantStore::new(clock.clone())),
//!     IntentBuilder::new(references.clone(), clock.clone(), DEFAULT_INTENT_TTL, "x402 content"),
//!     Verifier::new(ledger, references, clock, Duration::from_secs(15)),
//!     DEFAULT_GRANT_TTL,
//! );
//!
//! let decision = gate
//!     .evaluate("/premium/article", &Subject::new("session-1"), InBandProof::Absent)
//!     .await;
//! assert_eq!(decision.label(), "payment_required");
//! # Ok(())
//! # }
//! ```

// Core types
pub mod clock;
pub mod constants;
pub mod error;
pub mod payment;
pub mod price;
pub mod response;

// Policy and intents
pub mod catalog;
pub mod intent;
pub mod policy;
pub mod reference;

// Verification
pub mod facilitator_client;
pub mod hmac;
pub mod ledger;
pub mod verifier;

// Access
pub mod gate;
pub mod grant_store;
pub mod security;
pub mod storage;

// Client-side polling
pub mod poller;

// Re-exports
pub use catalog::{ResourceCatalog, StaticCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use constants::*;
pub use error::X402Error;
pub use facilitator_client::FacilitatorVerifier;
pub use gate::{AccessDecision, AccessGate, AllowReason, InBandProof, Subject};
pub use grant_store::{AccessGrant, GrantStore, InMemoryGrantStore, SqliteGrantStore};
pub use intent::{IntentBuilder, PaymentIntent};
pub use ledger::LedgerVerifier;
pub use payment::{
    PaymentRequiredBody, PaymentRequirements, PaymentStatus, PaymentSubmission, StatusResponse,
};
pub use policy::{
    GlobalPolicy, PolicyEntry, PolicyMode, PolicyResolver, ProtectedPaths, ProtectedResource,
    Protection, ResolvedMode,
};
pub use poller::{
    run_poller, HttpStatusSource, PollAction, PollOutcome, PollerConfig, PollerState,
    StatusPoller, StatusSource,
};
pub use price::{Currency, Price};
pub use reference::{InMemoryReferenceStore, ReferenceRecord, ReferenceStore, SqliteReferenceStore};
pub use response::{PaymentResponse, VerifyResponse};
pub use verifier::{
    ConfiguredVerifier, Observation, PaymentProof, SettlementVerifier, VerificationResult,
    Verifier,
};
