//! Thin driver over the `k3d` CLI for local cluster lifecycle.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::process::Command;

#[derive(Clone, Default)]
pub struct K3dClient;

#[derive(Debug, Clone, Deserialize)]
pub struct K3dClusterInfo {
    pub name: String,
    #[serde(rename = "serversRunning", default)]
    pub servers_running: i64,
}

impl K3dClusterInfo {
    pub fn is_running(&self) -> bool {
        self.servers_running > 0
    }
}

impl K3dClient {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(?args, "running k3d");
        let output = Command::new("k3d")
            .args(args)
            .output()
            .await
            .context("failed to spawn k3d; is it installed and on PATH?")?;
        if !output.status.success() {
            bail!(
                "k3d {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    pub async fn list(&self) -> Result<Vec<K3dClusterInfo>> {
        let raw = self.run(&["cluster", "list", "-o", "json"]).await?;
        let clusters: Vec<K3dClusterInfo> =
            serde_json::from_str(raw.trim()).context("failed to parse k3d cluster list")?;
        Ok(clusters)
    }

    pub async fn get(&self, name: &str) -> Result<Option<K3dClusterInfo>> {
        Ok(self.list().await?.into_iter().find(|c| c.name == name))
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.get(name).await?.is_some())
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.get(name).await?.is_some_and(|c| c.is_running()))
    }

    /// Create a cluster with the API and admin ports published through the
    /// k3d load balancer so host-side clients can reach the control plane.
    pub async fn create(&self, name: &str, api_port: u16, admin_port: u16) -> Result<()> {
        let api_mapping = format!("{api_port}:{api_port}@loadbalancer");
        let admin_mapping = format!("{admin_port}:{admin_port}@loadbalancer");
        self.run(&[
            "cluster",
            "create",
            name,
            "--servers",
            "1",
            "--port",
            &api_mapping,
            "--port",
            &admin_mapping,
            "--wait",
            "--timeout",
            "120s",
        ])
        .await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.run(&["cluster", "start", name, "--wait", "--timeout", "120s"])
            .await?;
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.run(&["cluster", "stop", name]).await?;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.run(&["cluster", "delete", name]).await?;
        Ok(())
    }
}
