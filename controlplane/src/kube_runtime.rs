//! Thin Kubernetes apply/observe layer. One client per instance; all
//! writes are server-side applies so repeated handlers stay idempotent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};

use crate::reconciler::{PodState, PodStatusSource};

pub struct WorkloadApplier {
    client: kube::Client,
}

impl WorkloadApplier {
    /// Infer configuration from the environment: in-cluster service
    /// account when running as the control plane, kubeconfig otherwise.
    pub async fn from_env() -> Result<Self> {
        let config = kube::Config::infer()
            .await
            .context("failed to infer kubernetes configuration")?;
        let client = kube::Client::try_from(config).context("failed to build kubernetes client")?;
        Ok(Self { client })
    }

    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn params() -> PatchParams {
        PatchParams::apply("kecs").force()
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.patch(namespace, &Self::params(), &Patch::Apply(&object))
            .await
            .with_context(|| format!("failed to ensure namespace {namespace}"))?;
        Ok(())
    }

    fn target<'a, K>(&self, meta: &'a ObjectMeta) -> Result<(Api<K>, &'a str, &'a str)>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + serde::de::DeserializeOwned
            + 'static,
        K::DynamicType: Default,
    {
        let name = meta.name.as_deref().context("object missing name")?;
        let namespace = meta
            .namespace
            .as_deref()
            .context("object missing namespace")?;
        Ok((
            Api::namespaced(self.client.clone(), namespace),
            namespace,
            name,
        ))
    }

    pub async fn apply_deployment(&self, deployment: &Deployment) -> Result<()> {
        let (api, namespace, name) = self.target::<Deployment>(&deployment.metadata)?;
        self.ensure_namespace(namespace).await?;
        api.patch(name, &Self::params(), &Patch::Apply(deployment))
            .await
            .with_context(|| format!("failed to apply deployment {namespace}/{name}"))?;
        tracing::debug!(%namespace, %name, "deployment applied");
        Ok(())
    }

    pub async fn apply_service(&self, service: &Service) -> Result<()> {
        let (api, namespace, name) = self.target::<Service>(&service.metadata)?;
        self.ensure_namespace(namespace).await?;
        api.patch(name, &Self::params(), &Patch::Apply(service))
            .await
            .with_context(|| format!("failed to apply service {namespace}/{name}"))?;
        Ok(())
    }

    pub async fn apply_pod(&self, pod: &Pod) -> Result<()> {
        let (api, namespace, name) = self.target::<Pod>(&pod.metadata)?;
        self.ensure_namespace(namespace).await?;
        api.patch(name, &Self::params(), &Patch::Apply(pod))
            .await
            .with_context(|| format!("failed to apply pod {namespace}/{name}"))?;
        Ok(())
    }

    pub async fn apply_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let (api, namespace, name) = self.target::<Endpoints>(&endpoints.metadata)?;
        self.ensure_namespace(namespace).await?;
        api.patch(name, &Self::params(), &Patch::Apply(endpoints))
            .await
            .with_context(|| format!("failed to apply endpoints {namespace}/{name}"))?;
        Ok(())
    }

    pub async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete deployment {name}")),
        }
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete pod {name}")),
        }
    }
}

/// Pod observation for the reconciler, backed by the same client.
pub struct KubePodSource {
    client: kube::Client,
}

impl KubePodSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodStatusSource for KubePodSource {
    async fn pod_state(&self, namespace: &str, name: &str) -> Result<PodState> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let Some(pod) = api.get_opt(name).await? else {
            return Ok(PodState::Missing);
        };
        Ok(classify_pod(&pod))
    }
}

fn classify_pod(pod: &Pod) -> PodState {
    let Some(pod_status) = pod.status.as_ref() else {
        return PodState::Pending;
    };
    let exit_code = pod_status
        .container_statuses
        .as_ref()
        .and_then(|statuses| {
            statuses
                .iter()
                .filter_map(|s| s.state.as_ref()?.terminated.as_ref())
                .map(|t| i64::from(t.exit_code))
                .max()
        })
        .unwrap_or(0);
    match pod_status.phase.as_deref() {
        Some("Running") => PodState::Running,
        Some("Succeeded") => PodState::Succeeded { exit_code },
        Some("Failed") => PodState::Failed {
            exit_code: if exit_code == 0 { 1 } else { exit_code },
        },
        _ => PodState::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };

    fn pod_with(phase: &str, exit_code: Option<i32>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: exit_code.map(|code| {
                    vec![ContainerStatus {
                        name: "app".to_string(),
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: code,
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn classifies_phases() {
        assert_eq!(classify_pod(&pod_with("Running", None)), PodState::Running);
        assert_eq!(
            classify_pod(&pod_with("Succeeded", Some(0))),
            PodState::Succeeded { exit_code: 0 }
        );
        assert_eq!(
            classify_pod(&pod_with("Failed", Some(137))),
            PodState::Failed { exit_code: 137 }
        );
        // A failed pod without terminated statuses still reports non-zero.
        assert_eq!(
            classify_pod(&pod_with("Failed", None)),
            PodState::Failed { exit_code: 1 }
        );
        assert_eq!(classify_pod(&pod_with("Pending", None)), PodState::Pending);
        assert_eq!(classify_pod(&Pod::default()), PodState::Pending);
    }
}
