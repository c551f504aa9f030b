//! Per-instance persisted configuration (`config.json` next to the data
//! directory). Loading is tolerant: a missing or unreadable file degrades
//! to defaults so a broken config never hides an instance.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub instance_name: String,
    pub api_port: u16,
    pub admin_port: u16,
    #[serde(default)]
    pub disable_localstack: bool,
    #[serde(default)]
    pub disable_elbv2: bool,
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl InstanceConfig {
    pub fn defaults(name: &str) -> Self {
        Self {
            instance_name: name.to_string(),
            api_port: kecs_common::DEFAULT_API_PORT,
            admin_port: kecs_common::DEFAULT_ADMIN_PORT,
            disable_localstack: false,
            disable_elbv2: false,
            dev_mode: false,
            data_dir: None,
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Load, falling back to defaults on any failure.
    pub async fn load_or_default(path: &Path, name: &str) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(instance = name, error = %e, "unreadable config, using defaults");
                Self::defaults(name)
            }
        }
    }

    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
