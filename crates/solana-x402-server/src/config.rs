use std::env;
use std::time::Duration;

use url::Url;
use x402::{
    default_rpc_endpoints, Currency, Price, RpcEndpoint, DEFAULT_GRANT_TTL, DEFAULT_INTENT_TTL,
    DEFAULT_VERIFY_TIMEOUT,
};

const DEFAULT_ENDPOINT: &str = "mainnet-beta";
const DEFAULT_PRICE: &str = "0.01";
const DEFAULT_LABEL: &str = "x402 content";
const DEFAULT_CONTENT_DIR: &str = "./public";
const DEFAULT_PORT: u16 = 4402;
const DEFAULT_RATE_LIMIT_RPM: u32 = 120;

/// Extra time the verifier gets on top of the per-call timeout.
const VERIFY_CEILING_SLACK: Duration = Duration::from_secs(5);

/// How settlement is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    /// Query Solana RPC endpoints directly.
    Ledger,
    /// Delegate to an x402 facilitator.
    Facilitator,
}

/// What an unpaid request gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// 402 with a JSON payment description.
    Status,
    /// 302 to the payment presentation route.
    Redirect,
}

#[derive(Clone)]
pub struct GateConfig {
    /// Recipient for Global policies. `None` leaves payments unconfigured.
    pub merchant_address: Option<String>,
    pub rpc_endpoints: Vec<RpcEndpoint>,
    pub default_endpoint: String,
    pub verification_mode: VerificationMode,
    pub facilitator_url: Option<String>,
    /// HMAC key for facilitator requests and payment receipts.
    pub hmac_secret: Option<Vec<u8>>,
    /// Price applied by Global policies.
    pub default_price: Price,
    /// Globs for paths protected without a catalog entry.
    pub protected_paths: Vec<String>,
    pub resources_file: Option<String>,
    pub grant_ttl: Duration,
    pub intent_ttl: Duration,
    pub response_mode: ResponseMode,
    /// Per-call verification timeout.
    pub verify_timeout: Duration,
    /// Label shown in the wallet for the payment URI.
    pub label: String,
    /// Bearer token that bypasses payment.
    pub admin_token: Option<String>,
    pub blocked_subjects: Vec<String>,
    /// SQLite file for grants and references (None = in-memory).
    pub db_path: Option<String>,
    pub content_dir: String,
    pub port: u16,
    pub rate_limit_rpm: u32,
    pub allowed_origins: Vec<String>,
    /// Bearer token required for /metrics endpoint (None = public)
    pub metrics_token: Option<String>,
}

impl std::fmt::Debug for GateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateConfig")
            .field("merchant_address", &self.merchant_address)
            .field("rpc_endpoints", &self.rpc_endpoints)
            .field("default_endpoint", &self.default_endpoint)
            .field("verification_mode", &self.verification_mode)
            .field("facilitator_url", &self.facilitator_url)
            .field(
                "hmac_secret",
                &self.hmac_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("default_price", &self.default_price)
            .field("protected_paths", &self.protected_paths)
            .field("resources_file", &self.resources_file)
            .field("grant_ttl", &self.grant_ttl)
            .field("intent_ttl", &self.intent_ttl)
            .field("response_mode", &self.response_mode)
            .field("verify_timeout", &self.verify_timeout)
            .field("label", &self.label)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("blocked_subjects", &self.blocked_subjects)
            .field("db_path", &self.db_path)
            .field("content_dir", &self.content_dir)
            .field("port", &self.port)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl GateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let merchant_address = get("X402_MERCHANT_ADDRESS");
        if let Some(ref address) = merchant_address {
            x402::reference::validate_address(address)
                .map_err(|_| ConfigError::InvalidAddress(address.clone()))?;
        } else {
            tracing::warn!("X402_MERCHANT_ADDRESS not set; protected resources will report payments as not configured");
        }

        let rpc_endpoints = match get("X402_RPC_ENDPOINTS") {
            Some(list) => parse_endpoints(&list)?,
            None => default_rpc_endpoints(),
        };
        let default_endpoint =
            get("X402_DEFAULT_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        if !rpc_endpoints.iter().any(|e| e.name == default_endpoint) {
            return Err(ConfigError::UnknownEndpoint(default_endpoint));
        }

        let verification_mode = match get("X402_VERIFICATION_MODE").as_deref() {
            None | Some("ledger") => VerificationMode::Ledger,
            Some("facilitator") => VerificationMode::Facilitator,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "X402_VERIFICATION_MODE",
                    other.to_string(),
                ))
            }
        };

        let facilitator_url = get("X402_FACILITATOR_URL");
        if let Some(ref url) = facilitator_url {
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.clone()))?;
        } else if verification_mode == VerificationMode::Facilitator {
            return Err(ConfigError::MissingRequired("X402_FACILITATOR_URL"));
        }

        let hmac_secret = get("FACILITATOR_SHARED_SECRET").map(String::into_bytes);
        if let Some(ref secret) = hmac_secret {
            if secret.len() < 32 {
                tracing::warn!(
                    "FACILITATOR_SHARED_SECRET is too short ({} bytes, minimum 32); \
                     use `openssl rand -hex 32` to generate one",
                    secret.len()
                );
            }
        } else if verification_mode == VerificationMode::Facilitator {
            tracing::warn!("FACILITATOR_SHARED_SECRET not set; facilitator requests are unauthenticated");
        }

        let currency: Currency = get("X402_CURRENCY")
            .as_deref()
            .unwrap_or("SOL")
            .parse()
            .map_err(|e: x402::X402Error| ConfigError::InvalidPrice(e.to_string()))?;
        let price = get("X402_DEFAULT_PRICE").unwrap_or_else(|| DEFAULT_PRICE.to_string());
        let default_price = Price::parse(&price, currency)
            .map_err(|e| ConfigError::InvalidPrice(e.to_string()))?;

        let response_mode = match get("X402_RESPONSE_MODE").as_deref() {
            None | Some("status") => ResponseMode::Status,
            Some("redirect") => ResponseMode::Redirect,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "X402_RESPONSE_MODE",
                    other.to_string(),
                ))
            }
        };

        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|s| split_list(&s))
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://localhost:5173".to_string(),
                ]
            });

        let metrics_token = get("METRICS_TOKEN");
        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set; /metrics endpoint is publicly accessible");
        }

        Ok(Self {
            merchant_address,
            rpc_endpoints,
            default_endpoint,
            verification_mode,
            facilitator_url,
            hmac_secret,
            default_price,
            protected_paths: get("X402_PROTECTED_PATHS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            resources_file: get("X402_RESOURCES_FILE"),
            grant_ttl: secs(&get, "X402_GRANT_TTL_SECS", DEFAULT_GRANT_TTL)?,
            intent_ttl: secs(&get, "X402_INTENT_TTL_SECS", DEFAULT_INTENT_TTL)?,
            response_mode,
            verify_timeout: secs(&get, "X402_VERIFY_TIMEOUT_SECS", DEFAULT_VERIFY_TIMEOUT)?,
            label: get("X402_LABEL").unwrap_or_else(|| DEFAULT_LABEL.to_string()),
            admin_token: get("X402_ADMIN_TOKEN"),
            blocked_subjects: get("X402_BLOCKED_SUBJECTS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            db_path: get("X402_DB_PATH"),
            content_dir: get("CONTENT_DIR").unwrap_or_else(|| DEFAULT_CONTENT_DIR.to_string()),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            rate_limit_rpm: parse_or(&get, "RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?,
            allowed_origins,
            metrics_token,
        })
    }

    /// Upper bound on a whole verification, retries included.
    pub fn verify_ceiling(&self) -> Duration {
        self.verify_timeout + VERIFY_CEILING_SLACK
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `name=url,name=url`.
fn parse_endpoints(value: &str) -> Result<Vec<RpcEndpoint>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|item| {
            let (name, url) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue("X402_RPC_ENDPOINTS", item.clone()))?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() {
                return Err(ConfigError::InvalidValue("X402_RPC_ENDPOINTS", item.clone()));
            }
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
            Ok(RpcEndpoint::new(name, url))
        })
        .collect()
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue(key, v)),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_or::<G, u64>(get, key, default.as_secs())? {
        0 => Err(ConfigError::InvalidValue(key, "0".to_string())),
        n => Ok(Duration::from_secs(n)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("default RPC endpoint '{0}' is not among the configured endpoints")]
    UnknownEndpoint(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MERCHANT: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

    fn load(vars: &[(&str, &str)]) -> Result<GateConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GateConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.merchant_address, None);
        assert_eq!(config.default_endpoint, "mainnet-beta");
        assert_eq!(config.rpc_endpoints.len(), 2);
        assert_eq!(config.verification_mode, VerificationMode::Ledger);
        assert_eq!(config.response_mode, ResponseMode::Status);
        assert_eq!(config.default_price.amount, 10_000_000);
        assert_eq!(config.grant_ttl, Duration::from_secs(3600));
        assert_eq!(config.intent_ttl, Duration::from_secs(900));
        assert_eq!(config.verify_ceiling(), Duration::from_secs(15));
        assert_eq!(config.port, 4402);
        assert!(config.protected_paths.is_empty());
    }

    #[test]
    fn test_full_configuration() {
        let config = load(&[
            ("X402_MERCHANT_ADDRESS", MERCHANT),
            ("X402_RPC_ENDPOINTS", "a=http://localhost:8899, b=http://localhost:8900"),
            ("X402_DEFAULT_ENDPOINT", "b"),
            ("X402_DEFAULT_PRICE", "1.5"),
            ("X402_CURRENCY", "USDC"),
            ("X402_PROTECTED_PATHS", "/premium/*, /reports/**"),
            ("X402_RESPONSE_MODE", "redirect"),
            ("X402_GRANT_TTL_SECS", "60"),
            ("X402_BLOCKED_SUBJECTS", "mallory,eve"),
        ])
        .unwrap();
        assert_eq!(config.merchant_address.as_deref(), Some(MERCHANT));
        assert_eq!(config.rpc_endpoints[1].url, "http://localhost:8900");
        assert_eq!(config.default_price.amount, 1_500_000);
        assert_eq!(config.protected_paths, vec!["/premium/*", "/reports/**"]);
        assert_eq!(config.response_mode, ResponseMode::Redirect);
        assert_eq!(config.grant_ttl, Duration::from_secs(60));
        assert_eq!(config.blocked_subjects, vec!["mallory", "eve"]);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            load(&[("X402_MERCHANT_ADDRESS", "0xnot-base58")]),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(matches!(
            load(&[("X402_DEFAULT_ENDPOINT", "testnet")]),
            Err(ConfigError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            load(&[("X402_RPC_ENDPOINTS", "no-equals-sign")]),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(&[("X402_GRANT_TTL_SECS", "0")]),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(&[("X402_DEFAULT_PRICE", "abc")]),
            Err(ConfigError::InvalidPrice(_))
        ));
    }

    #[test]
    fn test_facilitator_mode_requires_url() {
        assert!(matches!(
            load(&[("X402_VERIFICATION_MODE", "facilitator")]),
            Err(ConfigError::MissingRequired("X402_FACILITATOR_URL"))
        ));
        let config = load(&[
            ("X402_VERIFICATION_MODE", "facilitator"),
            ("X402_FACILITATOR_URL", "http://localhost:4022"),
        ])
        .unwrap();
        assert_eq!(config.verification_mode, VerificationMode::Facilitator);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&[
            ("FACILITATOR_SHARED_SECRET", "super-secret-hmac-key"),
            ("X402_ADMIN_TOKEN", "admin-token"),
            ("METRICS_TOKEN", "metrics-token"),
        ])
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("admin-token"));
        assert!(!debug.contains("metrics-token"));
        assert!(debug.contains("[REDACTED]"));
    }
}
