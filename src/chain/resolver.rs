//! Identity resolver: payer fid to verified ETH destination.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{OpsError, OpsResult};

/// Resolution outcome. An unresolvable payer is a per-record failure, not a
/// transport error: `valid = false` with the resolver's reason.
#[derive(Debug, Clone)]
pub struct ResolvedDestination {
    pub valid: bool,
    pub destination: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, fid: u64) -> OpsResult<ResolvedDestination>;
}

/// HTTP client for the Farcaster identity API: resolves a fid to its primary
/// verified ETH address.
pub struct FarcasterResolver {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct UserResponse {
    user: UserBody,
}

#[derive(Deserialize)]
struct UserBody {
    #[serde(default)]
    verified_addresses: VerifiedAddresses,
}

#[derive(Deserialize, Default)]
struct VerifiedAddresses {
    #[serde(default)]
    eth_addresses: Vec<String>,
}

impl FarcasterResolver {
    pub fn new(base_url: String, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("build resolver http client: {e}"))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl IdentityResolver for FarcasterResolver {
    async fn resolve(&self, fid: u64) -> OpsResult<ResolvedDestination> {
        let resp = self
            .http
            .get(format!("{}/v2/user", self.base_url))
            .query(&[("fid", fid.to_string())])
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| OpsError::Resolution(format!("identity api unreachable: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ResolvedDestination {
                valid: false,
                destination: None,
                error: Some(format!("fid {fid} not found")),
            });
        }
        if !resp.status().is_success() {
            return Err(OpsError::Resolution(format!(
                "identity api returned {} for fid {fid}",
                resp.status()
            )));
        }

        let parsed: UserResponse = resp
            .json()
            .await
            .map_err(|e| OpsError::Resolution(format!("malformed identity response: {e}")))?;

        match parsed.user.verified_addresses.eth_addresses.first() {
            Some(address) => {
                debug!(fid, address, "resolved payer destination");
                Ok(ResolvedDestination {
                    valid: true,
                    destination: Some(address.clone()),
                    error: None,
                })
            }
            None => Ok(ResolvedDestination {
                valid: false,
                destination: None,
                error: Some(format!("fid {fid} has no verified eth address")),
            }),
        }
    }
}
