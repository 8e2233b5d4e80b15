use crate::config::{GateConfig, VerificationMode};
use std::sync::Arc;
use x402::{
    AccessGate, Clock, ConfiguredVerifier, FacilitatorVerifier, GlobalPolicy, GrantStore,
    InMemoryGrantStore, InMemoryReferenceStore, IntentBuilder, LedgerVerifier, PolicyResolver,
    ProtectedPaths, ReferenceStore, ResourceCatalog, SqliteGrantStore, SqliteReferenceStore,
    StaticCatalog, SystemClock, Verifier, X402Error,
};

pub type Gate = AccessGate<ConfiguredVerifier>;

/// Paths the gate never charges for: its own routes.
pub const EXEMPT_PREFIXES: [&str; 3] = ["/x402", "/health", "/metrics"];

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GateConfig>,
    pub gate: Arc<Gate>,
    pub references: Arc<dyn ReferenceStore>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(config: GateConfig) -> Result<Self, X402Error> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Assemble stores, catalog and verifier from configuration.
    pub fn with_clock(config: GateConfig, clock: Arc<dyn Clock>) -> Result<Self, X402Error> {
        let http = reqwest::Client::builder()
            .timeout(config.verify_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let (references, grants): (Arc<dyn ReferenceStore>, Arc<dyn GrantStore>) =
            match config.db_path.as_deref() {
                Some(path) => (
                    Arc::new(SqliteReferenceStore::open(path)?),
                    Arc::new(SqliteGrantStore::open(path, clock.clone())?),
                ),
                None => (
                    Arc::new(InMemoryReferenceStore::new()),
                    Arc::new(InMemoryGrantStore::new(clock.clone())),
                ),
            };

        let catalog = load_catalog(&config)?;

        let resolver = PolicyResolver::new(GlobalPolicy {
            price: config.default_price.clone(),
            recipient: config.merchant_address.clone(),
        });

        let strategy = match config.verification_mode {
            VerificationMode::Ledger => ConfiguredVerifier::Ledger(LedgerVerifier::new(
                http,
                config.rpc_endpoints.clone(),
                &config.default_endpoint,
                config.verify_timeout,
            )?),
            VerificationMode::Facilitator => {
                let url = config.facilitator_url.clone().ok_or_else(|| {
                    X402Error::NotConfigured("facilitator URL is not set".to_string())
                })?;
                let mut facilitator =
                    FacilitatorVerifier::new(http, url, config.verify_timeout, clock.clone());
                if let Some(ref secret) = config.hmac_secret {
                    facilitator = facilitator.with_hmac_secret(secret.clone());
                }
                ConfiguredVerifier::Facilitator(facilitator)
            }
        };

        let verifier = Verifier::new(
            strategy,
            references.clone(),
            clock.clone(),
            config.verify_ceiling(),
        );
        let intents = IntentBuilder::new(
            references.clone(),
            clock.clone(),
            config.intent_ttl,
            config.label.clone(),
        );

        let gate = AccessGate::new(resolver, catalog, grants, intents, verifier, config.grant_ttl)
            .with_exempt_prefixes(EXEMPT_PREFIXES)
            .with_blocked_subjects(config.blocked_subjects.clone());

        Ok(Self {
            config: Arc::new(config),
            gate: Arc::new(gate),
            references,
            clock,
        })
    }

    /// Facilitator base URL advertised in 402 bodies.
    pub fn facilitator_url(&self) -> Option<&str> {
        self.gate.verifier().strategy().facilitator_url()
    }

    /// Drop expired grants and expired references. Confirmed references are
    /// kept for one grant lifetime past their expiry.
    pub fn purge_expired(&self) -> (usize, usize) {
        let grants = self.gate.grants().purge_expired();
        let references = match self
            .references
            .purge_expired(self.clock.now(), self.config.grant_ttl)
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "failed to purge expired references");
                0
            }
        };
        (grants, references)
    }
}

fn load_catalog(config: &GateConfig) -> Result<Arc<dyn ResourceCatalog>, X402Error> {
    let protected = ProtectedPaths::new(config.protected_paths.as_slice())?;
    let catalog = match config.resources_file.as_deref() {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                X402Error::NotConfigured(format!("cannot read resources file {path}: {e}"))
            })?;
            let catalog = StaticCatalog::from_json(&json, protected)?;
            tracing::info!(path = %path, resources = catalog.len(), "loaded resource catalog");
            catalog
        }
        None => StaticCatalog::new(protected),
    };
    Ok(Arc::new(catalog))
}
