//! Payment channel: the treasury service that moves real ETH.
//!
//! The treasury API blocks until the transfer is confirmed on-chain or has
//! definitively failed; it never reports a bare "submitted". The subsystem
//! treats anything other than a confirmed receipt as failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::parse_wei;
use crate::error::{OpsError, OpsResult};

#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub confirmed: bool,
    /// External transaction identifier (tx hash).
    pub reference: String,
}

#[async_trait]
pub trait PaymentChannel: Send + Sync {
    /// Transfer exactly `amount_wei` to `destination`. Blocks until the
    /// channel confirms or fails.
    async fn transfer(&self, destination: &str, amount_wei: u128) -> OpsResult<TransferReceipt>;

    /// Current operator wallet balance in wei.
    async fn operator_balance(&self) -> OpsResult<u128>;
}

/// HTTP client for the treasury service.
pub struct TreasuryClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    to: &'a str,
    amount_wei: String,
}

#[derive(Deserialize)]
struct TransferResponse {
    confirmed: bool,
    tx_hash: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance_wei: String,
}

impl TreasuryClient {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("build treasury http client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl PaymentChannel for TreasuryClient {
    async fn transfer(&self, destination: &str, amount_wei: u128) -> OpsResult<TransferReceipt> {
        debug!(destination, amount_wei, "💸 Treasury transfer requested");

        let resp = self
            .http
            .post(format!("{}/transfer", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&TransferRequest {
                to: destination,
                amount_wei: amount_wei.to_string(),
            })
            .send()
            .await
            .map_err(|e| OpsError::settlement(format!("treasury unreachable: {e}")))?;

        if resp.status() == reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(OpsError::balance_shortfall(format!(
                "treasury rejected transfer of {amount_wei} wei: insufficient operator balance"
            )));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, body, "treasury transfer rejected");
            return Err(OpsError::settlement(format!(
                "treasury returned {status}: {body}"
            )));
        }

        let parsed: TransferResponse = resp
            .json()
            .await
            .map_err(|e| OpsError::settlement(format!("malformed treasury response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(OpsError::settlement(format!("treasury error: {err}")));
        }

        Ok(TransferReceipt {
            confirmed: parsed.confirmed,
            reference: parsed.tx_hash,
        })
    }

    async fn operator_balance(&self) -> OpsResult<u128> {
        let resp = self
            .http
            .get(format!("{}/balance", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| OpsError::settlement(format!("treasury unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| OpsError::settlement(format!("treasury balance query failed: {e}")))?;

        let parsed: BalanceResponse = resp
            .json()
            .await
            .map_err(|e| OpsError::settlement(format!("malformed balance response: {e}")))?;

        parse_wei(&parsed.balance_wei)
            .map_err(|e| OpsError::settlement(format!("treasury balance unparsable: {e}")))
    }
}
