use std::time::Duration;

/// Network label reported in 402 bodies.
pub const SOLANA_NETWORK: &str = "solana";

/// URI scheme of a Solana Pay transfer request.
pub const SOLANA_PAY_SCHEME: &str = "solana";

/// Native SOL has 9 decimal places (lamports).
pub const SOL_DECIMALS: u8 = 9;

/// USDC mint on Solana mainnet-beta.
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// USDC has 6 decimal places.
pub const USDC_DECIMALS: u8 = 6;

/// Default public RPC endpoints, in preference order.
pub const MAINNET_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
pub const DEVNET_RPC_URL: &str = "https://api.devnet.solana.com";

/// Encoded length of a payment reference (32 bytes, base58).
pub const REFERENCE_LEN: usize = 44;

/// Header carrying an in-band payment payload (base64 JSON).
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Legacy header carrying the payload as raw JSON.
pub const LEGACY_PAYMENT_HEADER: &str = "X402-Payment";

/// Header set on successful in-band settlement.
pub const PAYMENT_RESPONSE_HEADER: &str = "X-PAYMENT-RESPONSE";

/// Marker header on redirect-style payment-required responses.
pub const PAYMENT_REQUIRED_HEADER: &str = "X-Payment-Required";

/// x402 protocol version carried in payloads.
pub const X402_VERSION: u32 = 1;

/// Default lifetime of an access grant.
pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(3600);

/// Default lifetime of a payment intent.
pub const DEFAULT_INTENT_TTL: Duration = Duration::from_secs(900);

/// Default per-call timeout for ledger and facilitator requests.
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Poller defaults: 40 attempts every 3 seconds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 40;

/// Ledger endpoint the gate reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    pub name: String,
    pub url: String,
}

impl RpcEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// The enabled endpoints, default first.
pub fn default_rpc_endpoints() -> Vec<RpcEndpoint> {
    vec![
        RpcEndpoint::new("mainnet-beta", MAINNET_RPC_URL),
        RpcEndpoint::new("devnet", DEVNET_RPC_URL),
    ]
}

/// Cookie holding the subject's session id.
pub const SESSION_COOKIE: &str = "x402_session";

/// Header carrying the session id for non-browser clients.
pub const SESSION_HEADER: &str = "X-X402-Session";
