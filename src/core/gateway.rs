// src/core/gateway.rs

//! Client for the upstream gateway API, which dictates the recommended
//! shard count and the session-start budget.

use crate::core::errors::MewldError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upstream-enforced rate limit on worker session starts.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds until the budget resets.
    pub reset_after: u64,
    pub max_concurrency: u64,
}

/// The gateway's answer: where to connect, how many shards to run, and
/// how many session starts are left in the current window.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GatewayInfo {
    #[serde(default)]
    pub url: String,
    pub shards: u64,
    pub session_start_limit: SessionStartLimit,
}

const GATEWAY_DEADLINE: Duration = Duration::from_secs(10);

/// Fetches the recommended shard count and session-start budget.
///
/// No retries at this layer; a network failure maps to `Transport`, a
/// non-200 status to `Auth`, and malformed JSON to `Decode`.
pub async fn get_gateway_info(url: &str, token: &str) -> Result<GatewayInfo, MewldError> {
    let client = reqwest::Client::builder()
        .timeout(GATEWAY_DEADLINE)
        .build()?;

    let res = client
        .get(url)
        .header("Authorization", format!("Bot {token}"))
        .header("User-Agent", concat!("mewld/", env!("CARGO_PKG_VERSION")))
        .header("Content-Type", "application/json")
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        return Err(MewldError::Auth(status.as_u16()));
    }

    let body = res.bytes().await?;
    let info: GatewayInfo =
        serde_json::from_slice(&body).map_err(|e| MewldError::Decode(e.to_string()))?;
    Ok(info)
}
