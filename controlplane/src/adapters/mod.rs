//! Thin adapters over the co-located emulator providers: credential
//! issuance, log ingestion, and the L7 load-balancer bookkeeping.

pub mod elbv2;
pub mod iam;
pub mod logs;

use std::time::Duration;

/// Default timeout for outbound calls to emulator providers.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn provider_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .unwrap_or_default()
}
