//! actix-web front end for the x402 Solana Pay gate.
//!
//! [`middleware::payment_gate`] wraps any service (static files in the
//! bundled binary); [`routes`] adds the payment presentation route, the
//! status endpoint polled by payment pages, and health/metrics.

pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod session;
pub mod state;

pub use config::{ConfigError, GateConfig, ResponseMode, VerificationMode};
pub use error::ServerError;
pub use state::AppState;

use std::time::Duration;

/// Purge expired grants and references every `period` until the runtime stops.
pub fn spawn_purge_task(state: AppState, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let (grants, references) = state.purge_expired();
            if grants + references > 0 {
                tracing::info!(grants, references, "purged expired entries");
            }
        }
    })
}
