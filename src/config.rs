//! Environment-driven configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Treasury (payment channel) service.
    pub treasury_url: String,
    pub treasury_api_key: String,
    /// Farcaster identity API.
    pub identity_url: String,
    pub identity_api_key: String,
    /// Bound on every external call so a hung dependency cannot wedge the
    /// settlement lock past its expiry.
    pub external_call_timeout: Duration,
    /// Settlement tick interval.
    pub settlement_poll: Duration,
    /// Dead-day scheduled-reopen check interval.
    pub reopen_poll: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            treasury_url: env::var("TREASURY_URL")
                .unwrap_or_else(|_| "http://localhost:8090".to_string()),
            treasury_api_key: env::var("TREASURY_API_KEY").unwrap_or_default(),
            identity_url: env::var("IDENTITY_API_URL")
                .unwrap_or_else(|_| "https://api.neynar.com".to_string()),
            identity_api_key: env::var("IDENTITY_API_KEY").unwrap_or_default(),
            external_call_timeout: Duration::from_secs(parse_env("EXTERNAL_CALL_TIMEOUT_SECS", 30)),
            settlement_poll: Duration::from_secs(parse_env("SETTLEMENT_POLL_SECS", 60)),
            reopen_poll: Duration::from_secs(parse_env("DEAD_DAY_REOPEN_POLL_SECS", 60)),
        }
    }
}

fn parse_env(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(default)
}

/// Anchor relative data paths to the crate directory so running from the repo
/// root doesn't create a stray empty DB in a different working directory.
pub fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_filename).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}
