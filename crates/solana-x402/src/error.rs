use thiserror::Error;

/// Errors returned by x402 gate operations.
#[derive(Debug, Error)]
pub enum X402Error {
    /// No recipient or price configured; no intent can be built.
    #[error("payments are not configured: {0}")]
    NotConfigured(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Status check against a reference this gate never issued.
    #[error("payment reference not found: {0}")]
    ReferenceNotFound(String),

    /// Subject may not attempt payment at all.
    #[error("access denied for subject {0}")]
    AccessDenied(String),

    /// Network failure, timeout or ambiguous ledger state. Never terminal.
    #[error("transient verification error: {0}")]
    Transient(String),

    /// Explicit rejection by the ledger or facilitator.
    #[error("invalid payment proof: {0}")]
    InvalidProof(String),

    /// Request path refused before any resource lookup.
    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("invalid payment payload: {0}")]
    InvalidPayload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for X402Error {
    fn from(e: rusqlite::Error) -> Self {
        X402Error::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for X402Error {
    fn from(e: reqwest::Error) -> Self {
        X402Error::Transient(e.to_string())
    }
}
