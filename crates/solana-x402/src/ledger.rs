//! Direct settlement verification over Solana JSON-RPC.
//!
//! The payer's wallet attaches the intent's reference to the transfer as a
//! read-only account, so `getSignaturesForAddress(reference)` finds it. Each
//! candidate transaction is then fetched and the amount credited to the
//! recipient is measured from the balance deltas in its metadata.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::constants::RpcEndpoint;
use crate::error::X402Error;
use crate::intent::PaymentIntent;
use crate::payment::PaymentSubmission;
use crate::price::Currency;
use crate::verifier::{Observation, SettlementVerifier};

/// How many signatures to inspect per reference.
const SIGNATURE_LIMIT: usize = 10;
const COMMITMENT: &str = "confirmed";

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
    signature: String,
    #[serde(default)]
    err: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct Transaction {
    meta: Option<TransactionMeta>,
    transaction: TransactionBody,
}

#[derive(Debug, Clone, Deserialize)]
struct TransactionBody {
    message: Message,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Message {
    account_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMeta {
    #[serde(default)]
    err: Option<serde_json::Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    post_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    loaded_addresses: Option<LoadedAddresses>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LoadedAddresses {
    #[serde(default)]
    writable: Vec<String>,
    #[serde(default)]
    readonly: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBalance {
    account_index: usize,
    mint: String,
    #[serde(default)]
    owner: Option<String>,
    ui_token_amount: TokenAmount,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenAmount {
    amount: String,
}

impl Transaction {
    /// Static keys followed by keys loaded from lookup tables, in index order.
    fn account_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .transaction
            .message
            .account_keys
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(loaded) = self.meta.as_ref().and_then(|m| m.loaded_addresses.as_ref()) {
            keys.extend(loaded.writable.iter().map(String::as_str));
            keys.extend(loaded.readonly.iter().map(String::as_str));
        }
        keys
    }

    fn failed(&self) -> bool {
        self.meta.as_ref().is_some_and(|m| m.err.is_some())
    }

    fn mentions(&self, address: &str) -> bool {
        self.account_keys().contains(&address)
    }

    /// Base units credited to `recipient` by this transaction.
    fn credited(&self, recipient: &str, currency: &Currency) -> u64 {
        let Some(meta) = self.meta.as_ref() else {
            return 0;
        };
        match currency.mint() {
            None => {
                let Some(index) = self.account_keys().iter().position(|k| *k == recipient) else {
                    return 0;
                };
                let pre = meta.pre_balances.get(index).copied().unwrap_or(0);
                let post = meta.post_balances.get(index).copied().unwrap_or(0);
                post.saturating_sub(pre)
            }
            Some(mint) => meta
                .post_token_balances
                .iter()
                .filter(|b| b.mint == mint && b.owner.as_deref() == Some(recipient))
                .map(|post| {
                    let pre = meta
                        .pre_token_balances
                        .iter()
                        .find(|b| b.account_index == post.account_index)
                        .and_then(|b| b.ui_token_amount.amount.parse::<u64>().ok())
                        .unwrap_or(0);
                    let post = post.ui_token_amount.amount.parse::<u64>().unwrap_or(0);
                    post.saturating_sub(pre)
                })
                .fold(0u64, u64::saturating_add),
        }
    }
}

/// Verifies settlement by querying Solana RPC endpoints directly.
pub struct LedgerVerifier {
    http: reqwest::Client,
    /// Default endpoint first; the rest are fallbacks.
    endpoints: Vec<RpcEndpoint>,
    timeout: Duration,
}

impl LedgerVerifier {
    /// `default` names the endpoint queried first.
    pub fn new(
        http: reqwest::Client,
        mut endpoints: Vec<RpcEndpoint>,
        default: &str,
        timeout: Duration,
    ) -> Result<Self, X402Error> {
        if endpoints.is_empty() {
            return Err(X402Error::NotConfigured(
                "no ledger endpoints enabled".to_string(),
            ));
        }
        let Some(position) = endpoints.iter().position(|e| e.name == default) else {
            return Err(X402Error::NotConfigured(format!(
                "default endpoint '{default}' is not an enabled endpoint"
            )));
        };
        endpoints[..=position].rotate_right(1);
        Ok(Self {
            http,
            endpoints,
            timeout,
        })
    }

    pub fn endpoints(&self) -> &[RpcEndpoint] {
        &self.endpoints
    }

    /// Call `method` on each endpoint in turn until one answers.
    async fn rpc<T: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, X402Error> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let mut last_error = String::new();

        for endpoint in &self.endpoints {
            let resp = match self
                .http
                .post(&endpoint.url)
                .json(&body)
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint.name, method, error = %e, "rpc request failed");
                    last_error = format!("{}: {e}", endpoint.name);
                    continue;
                }
            };

            if !resp.status().is_success() {
                tracing::warn!(endpoint = %endpoint.name, method, status = %resp.status(), "rpc endpoint returned error status");
                last_error = format!("{}: HTTP {}", endpoint.name, resp.status());
                continue;
            }

            let parsed: RpcResponse<T> = match resp.json().await {
                Ok(p) => p,
                Err(e) => {
                    last_error = format!("{}: unreadable response: {e}", endpoint.name);
                    continue;
                }
            };

            if let Some(err) = parsed.error {
                tracing::warn!(endpoint = %endpoint.name, method, code = err.code, message = %err.message, "rpc error");
                last_error = format!("{}: rpc error {}: {}", endpoint.name, err.code, err.message);
                continue;
            }
            return Ok(parsed.result);
        }

        Err(X402Error::Transient(format!(
            "all ledger endpoints failed ({last_error})"
        )))
    }

    async fn signatures_for(&self, reference: &str) -> Result<Vec<SignatureInfo>, X402Error> {
        let params = serde_json::json!([
            reference,
            { "limit": SIGNATURE_LIMIT, "commitment": COMMITMENT }
        ]);
        Ok(self
            .rpc::<Vec<SignatureInfo>>("getSignaturesForAddress", params)
            .await?
            .unwrap_or_default())
    }

    async fn transaction(&self, signature: &str) -> Result<Option<Transaction>, X402Error> {
        let params = serde_json::json!([
            signature,
            {
                "encoding": "json",
                "commitment": COMMITMENT,
                "maxSupportedTransactionVersion": 0
            }
        ]);
        self.rpc("getTransaction", params).await
    }

    /// Check one transaction the payer named directly.
    async fn observe_signature(
        &self,
        intent: &PaymentIntent,
        signature: &str,
    ) -> Result<Observation, X402Error> {
        let Some(tx) = self.transaction(signature).await? else {
            return Ok(Observation::NotFound);
        };
        if !tx.mentions(&intent.reference) {
            return Ok(Observation::Rejected(
                "transaction does not carry the payment reference".to_string(),
            ));
        }
        if tx.failed() {
            return Ok(Observation::Rejected(
                "payment transaction failed on-chain".to_string(),
            ));
        }
        let credited = tx.credited(&intent.recipient, &intent.currency);
        if credited == 0 {
            return Ok(Observation::Rejected(
                "transaction does not pay the recipient".to_string(),
            ));
        }
        Ok(Observation::Settled {
            settlement_id: signature.to_string(),
            amount_paid: credited,
        })
    }
}

impl SettlementVerifier for LedgerVerifier {
    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn observe(
        &self,
        intent: &PaymentIntent,
        submission: Option<&PaymentSubmission>,
    ) -> Result<Observation, X402Error> {
        if let Some(signature) = submission.and_then(|s| s.signature()) {
            return self.observe_signature(intent, signature).await;
        }

        let signatures = self.signatures_for(&intent.reference).await?;
        if signatures.is_empty() {
            return Ok(Observation::NotFound);
        }

        let mut best: Option<(String, u64)> = None;
        let mut unresolved = false;
        let mut failed = 0usize;

        for info in &signatures {
            if info.err.is_some() {
                failed += 1;
                continue;
            }
            let Some(tx) = self.transaction(&info.signature).await? else {
                unresolved = true;
                continue;
            };
            if tx.failed() {
                failed += 1;
                continue;
            }
            let credited = tx.credited(&intent.recipient, &intent.currency);
            if credited >= intent.amount {
                return Ok(Observation::Settled {
                    settlement_id: info.signature.clone(),
                    amount_paid: credited,
                });
            }
            if credited > best.as_ref().map_or(0, |(_, a)| *a) {
                best = Some((info.signature.clone(), credited));
            }
        }

        if unresolved {
            return Ok(Observation::NotFound);
        }
        if let Some((settlement_id, amount_paid)) = best {
            return Ok(Observation::Settled {
                settlement_id,
                amount_paid,
            });
        }
        if failed == signatures.len() {
            return Ok(Observation::Rejected(
                "payment transaction failed on-chain".to_string(),
            ));
        }
        Ok(Observation::Rejected(
            "transaction does not pay the recipient".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPIENT: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";

    fn tx(json: serde_json::Value) -> Transaction {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn sol_credit_uses_recipient_balance_delta() {
        let t = tx(serde_json::json!({
            "meta": {
                "err": null,
                "preBalances": [5_000_000_000u64, 1_000, 0],
                "postBalances": [4_989_995_000u64, 10_001_000, 0]
            },
            "transaction": { "message": { "accountKeys": ["payer", RECIPIENT, "ref"] } }
        }));
        assert_eq!(t.credited(RECIPIENT, &Currency::Sol), 10_000_000);
        assert!(t.mentions("ref"));
        assert!(!t.failed());
    }

    #[test]
    fn token_credit_uses_owner_and_mint() {
        let usdc = Currency::usdc();
        let mint = usdc.mint().unwrap().to_string();
        let t = tx(serde_json::json!({
            "meta": {
                "err": null,
                "preTokenBalances": [
                    { "accountIndex": 2, "mint": mint, "owner": RECIPIENT, "uiTokenAmount": { "amount": "500" } }
                ],
                "postTokenBalances": [
                    { "accountIndex": 2, "mint": mint, "owner": RECIPIENT, "uiTokenAmount": { "amount": "1500500" } },
                    { "accountIndex": 3, "mint": "OtherMint", "owner": RECIPIENT, "uiTokenAmount": { "amount": "999" } }
                ]
            },
            "transaction": { "message": { "accountKeys": ["payer", "src", "dst", "other"] } }
        }));
        assert_eq!(t.credited(RECIPIENT, &usdc), 1_500_000);
    }

    #[test]
    fn loaded_addresses_extend_account_keys() {
        let t = tx(serde_json::json!({
            "meta": {
                "err": { "InstructionError": [0, "Custom"] },
                "loadedAddresses": { "writable": [RECIPIENT], "readonly": ["ref"] },
                "preBalances": [10, 0, 0],
                "postBalances": [5, 5, 0]
            },
            "transaction": { "message": { "accountKeys": ["payer"] } }
        }));
        assert!(t.mentions("ref"));
        assert!(t.failed());
        assert_eq!(t.credited(RECIPIENT, &Currency::Sol), 5);
    }

    #[test]
    fn default_endpoint_is_tried_first() {
        let endpoints = vec![
            RpcEndpoint::new("a", "http://a"),
            RpcEndpoint::new("b", "http://b"),
            RpcEndpoint::new("c", "http://c"),
        ];
        let v = LedgerVerifier::new(reqwest::Client::new(), endpoints, "c", Duration::from_secs(1))
            .unwrap();
        let names: Vec<_> = v.endpoints().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn unknown_default_endpoint_is_not_configured() {
        let err = LedgerVerifier::new(
            reqwest::Client::new(),
            vec![RpcEndpoint::new("a", "http://a")],
            "mainnet-beta",
            Duration::from_secs(1),
        )
        .err()
        .unwrap();
        assert!(matches!(err, X402Error::NotConfigured(_)));
    }
}
