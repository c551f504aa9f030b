//! Credential issuance for task and execution roles, backed by the
//! co-located STS emulator. Issued credentials are cached per role and
//! refreshed as they approach expiry.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

/// Refresh this long before the reported expiry.
const EXPIRY_SLACK_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Unix epoch milliseconds.
    pub expiration: i64,
}

impl Credentials {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        self.expiration - EXPIRY_SLACK_MS > now_ms
    }

    /// Environment injected into pods whose task definition names a role.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            (
                "AWS_SECRET_ACCESS_KEY".to_string(),
                self.secret_access_key.clone(),
            ),
            ("AWS_SESSION_TOKEN".to_string(), self.session_token.clone()),
        ]
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn issue(&self, role_arn: &str) -> Result<Credentials>;
}

/// Caching front over any [`CredentialProvider`].
pub struct CredentialAdapter<P> {
    provider: P,
    cache: Mutex<HashMap<String, Credentials>>,
}

impl<P: CredentialProvider> CredentialAdapter<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn assume_role(&self, role_arn: &str) -> Result<Credentials> {
        let now = kecs_common::now_ms();
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(role_arn)
                && cached.is_fresh(now)
            {
                return Ok(cached.clone());
            }
        }
        let issued = self.provider.issue(role_arn).await?;
        self.cache
            .lock()
            .await
            .insert(role_arn.to_string(), issued.clone());
        Ok(issued)
    }
}

/// STS emulator-backed provider speaking the JSON-accepting query wire.
pub struct StsProvider {
    endpoint: String,
    http: reqwest::Client,
}

impl StsProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: super::provider_client(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleEnvelope {
    assume_role_response: AssumeRoleResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResponse {
    assume_role_result: AssumeRoleResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumeRoleResult {
    credentials: WireCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    /// Epoch seconds as the emulator reports it in JSON mode.
    expiration: f64,
}

#[async_trait]
impl CredentialProvider for StsProvider {
    async fn issue(&self, role_arn: &str) -> Result<Credentials> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(http::header::ACCEPT, "application/json")
            .form(&[
                ("Action", "AssumeRole"),
                ("Version", "2011-06-15"),
                ("RoleArn", role_arn),
                ("RoleSessionName", "kecs"),
            ])
            .send()
            .await
            .context("credential provider unreachable")?
            .error_for_status()
            .context("AssumeRole rejected")?;
        let envelope: AssumeRoleEnvelope = response
            .json()
            .await
            .context("malformed AssumeRole response")?;
        let wire = envelope.assume_role_response.assume_role_result.credentials;
        Ok(Credentials {
            access_key_id: wire.access_key_id,
            secret_access_key: wire.secret_access_key,
            session_token: wire.session_token,
            expiration: (wire.expiration * 1000.0) as i64,
        })
    }
}
