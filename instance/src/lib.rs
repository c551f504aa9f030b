//! Instance lifecycle orchestration.
//!
//! An instance is a named unit: one k3d cluster (`kecs-<name>`), one data
//! directory under `~/.kecs/instances/<name>/data`, the control-plane
//! deployment inside the cluster, and the optional LocalStack emulator and
//! log collector. Multiple instances coexist on one host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use kecs_common::CLUSTER_PREFIX;
use kecs_types::error::entities;
use kecs_types::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod deploy;
pub mod k3d;

use config::InstanceConfig;
use deploy::ComponentDeployer;
use k3d::K3dClient;

/// Maximum simultaneous component deployments during Start.
const DEPLOY_FAN_OUT: usize = 3;

pub const STEP_CREATE_CLUSTER: &str = "Creating k3d cluster";
pub const STEP_CREATE_NAMESPACE: &str = "Creating namespace";
pub const STEP_DEPLOY_CONTROL_PLANE: &str = "Deploying control plane";
pub const STEP_DEPLOY_LOCALSTACK: &str = "Deploying LocalStack";
pub const STEP_DEPLOY_LOG_COLLECTOR: &str = "Deploying log collector";
pub const STEP_FINALIZING: &str = "Finalizing";

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub instance_name: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub disable_localstack: bool,
    pub disable_elbv2: bool,
    pub api_port: Option<u16>,
    pub admin_port: Option<u16>,
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatus {
    pub step: String,
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub state: InstanceState,
    pub api_port: u16,
    pub admin_port: u16,
    pub has_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "STOPPED")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StartedInstance {
    pub name: String,
    pub api_port: u16,
    pub admin_port: u16,
}

type StatusMap = Arc<RwLock<HashMap<String, Vec<StepStatus>>>>;

#[derive(Clone)]
pub struct InstanceManager {
    k3d: K3dClient,
    status: StatusMap,
}

impl Default for InstanceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceManager {
    pub fn new() -> Self {
        Self {
            k3d: K3dClient::new(),
            status: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Snapshot of the creation progress for one instance, if any.
    pub async fn creation_status(&self, name: &str) -> Option<Vec<StepStatus>> {
        self.status.read().await.get(name).cloned()
    }

    async fn publish(&self, instance: &str, step: &str, state: StepState, message: Option<String>) {
        let mut map = self.status.write().await;
        let steps = map.entry(instance.to_string()).or_default();
        match steps.iter_mut().find(|s| s.step == step) {
            Some(existing) => {
                existing.state = state;
                existing.message = message;
            }
            None => steps.push(StepStatus {
                step: step.to_string(),
                state,
                message,
            }),
        }
    }

    async fn clear_status(&self, instance: &str) {
        self.status.write().await.remove(instance);
    }

    /// Run one creation step, stamping Running before and Done/Failed
    /// after. The failed entry keeps the error message for observers.
    async fn step<T, F>(&self, instance: &str, step: &str, fut: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        self.publish(instance, step, StepState::Running, None).await;
        match fut.await {
            Ok(out) => {
                self.publish(instance, step, StepState::Done, None).await;
                Ok(out)
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.publish(instance, step, StepState::Failed, Some(message.clone()))
                    .await;
                Err(Error::Unavailable(message))
            }
        }
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        self.k3d
            .is_running(&cluster_name(name))
            .await
            .map_err(unavailable)
    }

    /// Start (or restart) an instance. Publishes per-step progress through
    /// [`creation_status`]; on success the status entry is cleared.
    pub async fn start(
        &self,
        opts: StartOptions,
        cancel: &CancellationToken,
    ) -> Result<StartedInstance> {
        let existing = self.list().await?;
        let name = match &opts.instance_name {
            Some(name) => name.clone(),
            None => {
                let taken: Vec<String> = existing.iter().map(|i| i.name.clone()).collect();
                kecs_common::names::random_name(&taken)
            }
        };
        let cluster = cluster_name(&name);

        let current = self.k3d.get(&cluster).await.map_err(unavailable)?;
        if let Some(info) = &current
            && info.is_running()
        {
            return Err(Error::invalid(format!(
                "instance '{name}' is already running; stop it first or pick another name"
            )));
        }

        // Load any persisted config, then apply the caller's overrides.
        let config_path = match &opts.config_file {
            Some(path) => path.clone(),
            None => kecs_common::instance_config_path(&name).map_err(unavailable)?,
        };
        let mut config = InstanceConfig::load_or_default(&config_path, &name).await;
        if let Some(port) = opts.api_port {
            config.api_port = port;
        }
        if let Some(port) = opts.admin_port {
            config.admin_port = port;
        }
        config.disable_localstack = opts.disable_localstack;
        config.disable_elbv2 = opts.disable_elbv2;
        config.dev_mode = opts.dev_mode;
        if opts.data_dir.is_some() {
            config.data_dir = opts.data_dir.clone();
        }

        let data_dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => kecs_common::instance_data_dir(&name).map_err(unavailable)?,
        };
        tokio::fs::create_dir_all(&data_dir).await?;

        // Config persistence failures are worth a warning, never an abort.
        if let Err(e) = config.persist(&config_path).await {
            tracing::warn!(instance = %name, error = %e, "failed to persist instance config");
        }

        if current.is_some() {
            return self.restart(&name, config, cancel).await;
        }

        self.clear_status(&name).await;
        let result = self.create(&name, &cluster, &config, cancel).await;
        if result.is_ok() {
            self.clear_status(&name).await;
        }
        result
    }

    async fn create(
        &self,
        name: &str,
        cluster: &str,
        config: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<StartedInstance> {
        let api_port = config.api_port;
        let admin_port = config.admin_port;

        self.step(name, STEP_CREATE_CLUSTER, async {
            self.k3d.create(cluster, api_port, admin_port).await?;
            Ok(())
        })
        .await?;
        tracing::info!(instance = %name, api_port, admin_port, "k3d cluster created");

        let deployer = self
            .step(name, STEP_CREATE_NAMESPACE, async {
                let deployer = ComponentDeployer::connect(cluster).await?;
                deployer.ensure_namespace().await?;
                Ok(deployer)
            })
            .await?;

        self.deploy_components(name, Arc::new(deployer), config, cancel)
            .await?;

        self.step(name, STEP_FINALIZING, async { Ok(()) }).await?;
        Ok(StartedInstance {
            name: name.to_string(),
            api_port,
            admin_port,
        })
    }

    /// Deploy control plane, LocalStack and log collector in parallel with
    /// a bounded fan-out. The first fatal error wins; the log collector
    /// only ever warns.
    async fn deploy_components(
        &self,
        name: &str,
        deployer: Arc<ComponentDeployer>,
        config: &InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (err_tx, mut err_rx) = mpsc::channel::<(String, String)>(DEPLOY_FAN_OUT);
        let mut handles = Vec::new();

        {
            let manager = self.clone();
            let deployer = deployer.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let instance = name.to_string();
            handles.push(tokio::spawn(async move {
                let result = manager
                    .step(&instance, STEP_DEPLOY_CONTROL_PLANE, async {
                        deployer.deploy_control_plane(&config).await?;
                        ComponentDeployer::wait_control_plane_ready(config.admin_port, &cancel)
                            .await?;
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    let _ = err_tx.try_send((STEP_DEPLOY_CONTROL_PLANE.to_string(), e.to_string()));
                }
            }));
        }

        if !config.disable_localstack {
            let manager = self.clone();
            let deployer = deployer.clone();
            let cancel = cancel.clone();
            let err_tx = err_tx.clone();
            let instance = name.to_string();
            handles.push(tokio::spawn(async move {
                let result = manager
                    .step(&instance, STEP_DEPLOY_LOCALSTACK, async {
                        deployer.deploy_localstack().await?;
                        deployer
                            .wait_pod_ready(deploy::LOCALSTACK_NAME, &cancel)
                            .await?;
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    let _ = err_tx.try_send((STEP_DEPLOY_LOCALSTACK.to_string(), e.to_string()));
                }
            }));
        }

        {
            let manager = self.clone();
            let deployer = deployer.clone();
            let cancel = cancel.clone();
            let instance = name.to_string();
            handles.push(tokio::spawn(async move {
                let result = manager
                    .step(&instance, STEP_DEPLOY_LOG_COLLECTOR, async {
                        deployer.deploy_log_collector().await?;
                        deployer
                            .wait_pod_exists(deploy::LOG_COLLECTOR_NAME, &cancel)
                            .await?;
                        Ok(())
                    })
                    .await;
                // Log collector failures are logged, never fatal.
                if let Err(e) = result {
                    tracing::warn!(instance = %instance, error = %e, "log collector deploy failed");
                }
            }));
        }
        drop(err_tx);

        for handle in handles {
            let _ = handle.await;
        }
        if let Some((step, message)) = err_rx.recv().await {
            return Err(Error::Unavailable(format!("{step} failed: {message}")));
        }
        Ok(())
    }

    /// Restart branch: the cluster exists but is stopped. Start it, make
    /// sure the namespace survived, redeploy and wait again.
    async fn restart(
        &self,
        name: &str,
        config: InstanceConfig,
        cancel: &CancellationToken,
    ) -> Result<StartedInstance> {
        let cluster = cluster_name(name);
        self.clear_status(name).await;

        self.step(name, STEP_CREATE_CLUSTER, async {
            self.k3d.start(&cluster).await?;
            Ok(())
        })
        .await?;

        let deployer = self
            .step(name, STEP_CREATE_NAMESPACE, async {
                let deployer = ComponentDeployer::connect(&cluster).await?;
                if !deployer.namespace_exists().await? {
                    deployer.ensure_namespace().await?;
                }
                Ok(deployer)
            })
            .await?;

        self.deploy_components(name, Arc::new(deployer), &config, cancel)
            .await?;

        let config_path = kecs_common::instance_config_path(name).map_err(unavailable)?;
        if let Err(e) = config.persist(&config_path).await {
            tracing::warn!(instance = %name, error = %e, "failed to persist instance config");
        }

        self.step(name, STEP_FINALIZING, async { Ok(()) }).await?;
        self.clear_status(name).await;
        Ok(StartedInstance {
            name: name.to_string(),
            api_port: config.api_port,
            admin_port: config.admin_port,
        })
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let cluster = cluster_name(name);
        if !self.k3d.exists(&cluster).await.map_err(unavailable)? {
            return Err(Error::not_found(entities::INSTANCE, name));
        }
        self.k3d.stop(&cluster).await.map_err(unavailable)?;
        tracing::info!(instance = %name, "instance stopped");
        Ok(())
    }

    /// Delete the cluster unconditionally; the data directory only goes
    /// when `delete_data` is set.
    pub async fn destroy(&self, name: &str, delete_data: bool) -> Result<()> {
        let cluster = cluster_name(name);
        if !self.k3d.exists(&cluster).await.map_err(unavailable)? {
            return Err(Error::not_found(entities::INSTANCE, name));
        }
        self.k3d.delete(&cluster).await.map_err(unavailable)?;

        if delete_data {
            let data_dir = kecs_common::instance_data_dir(name).map_err(unavailable)?;
            if let Err(e) = tokio::fs::remove_dir_all(&data_dir).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(Error::Io(e));
            }
        }
        // The instance dir only goes if nothing else is left in it.
        if let Ok(dir) = kecs_common::instance_dir(name) {
            let _ = tokio::fs::remove_dir(&dir).await;
        }
        self.clear_status(name).await;
        tracing::info!(instance = %name, delete_data, "instance destroyed");
        Ok(())
    }

    /// Every k3d cluster named `kecs-*`, with state and persisted ports.
    /// A broken config never hides an instance.
    pub async fn list(&self) -> Result<Vec<InstanceSummary>> {
        let clusters = self.k3d.list().await.map_err(unavailable)?;
        let mut out = Vec::new();
        for cluster in clusters {
            let Some(name) = cluster.name.strip_prefix(CLUSTER_PREFIX) else {
                continue;
            };
            let config_path = kecs_common::instance_config_path(name).map_err(unavailable)?;
            let config = InstanceConfig::load_or_default(&config_path, name).await;
            let has_data = kecs_common::instance_data_dir(name)
                .map(|d| d.exists())
                .unwrap_or(false);
            out.push(InstanceSummary {
                name: name.to_string(),
                state: if cluster.is_running() {
                    InstanceState::Running
                } else {
                    InstanceState::Stopped
                },
                api_port: config.api_port,
                admin_port: config.admin_port,
                has_data,
            });
        }
        Ok(out)
    }
}

fn cluster_name(instance: &str) -> String {
    format!("{CLUSTER_PREFIX}{instance}")
}

fn unavailable(e: anyhow::Error) -> Error {
    Error::Unavailable(format!("{e:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_map_updates_in_place() {
        let manager = InstanceManager::new();
        manager
            .publish("dev", STEP_CREATE_CLUSTER, StepState::Running, None)
            .await;
        manager
            .publish("dev", STEP_CREATE_CLUSTER, StepState::Done, None)
            .await;
        manager
            .publish(
                "dev",
                STEP_DEPLOY_CONTROL_PLANE,
                StepState::Failed,
                Some("image pull failed".to_string()),
            )
            .await;

        let steps = manager.creation_status("dev").await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step, STEP_CREATE_CLUSTER);
        assert_eq!(steps[0].state, StepState::Done);
        assert_eq!(steps[1].state, StepState::Failed);
        assert_eq!(steps[1].message.as_deref(), Some("image pull failed"));

        manager.clear_status("dev").await;
        assert!(manager.creation_status("dev").await.is_none());
    }

    #[tokio::test]
    async fn failed_step_keeps_entry_and_returns_unavailable() {
        let manager = InstanceManager::new();
        let err = manager
            .step::<(), _>("dev", STEP_CREATE_CLUSTER, async {
                anyhow::bail!("no docker daemon")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        let steps = manager.creation_status("dev").await.unwrap();
        assert_eq!(steps[0].state, StepState::Failed);
        assert!(steps[0].message.as_ref().unwrap().contains("no docker"));
    }
}
