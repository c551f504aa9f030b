//! In-cluster component deployment: the control-plane Deployment, the
//! optional LocalStack emulator, and the non-critical log collector.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Namespace, Pod, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::config::KubeConfigOptions;
use tokio_util::sync::CancellationToken;

use crate::config::InstanceConfig;

pub const SYSTEM_NAMESPACE: &str = "kecs-system";
pub const CONTROL_PLANE_NAME: &str = "kecs-server";
pub const LOCALSTACK_NAME: &str = "localstack";
pub const LOG_COLLECTOR_NAME: &str = "kecs-log-collector";

const CONTROL_PLANE_IMAGE: &str = "kecs/controlplane:latest";
const LOCALSTACK_IMAGE: &str = "localstack/localstack:latest";
const LOG_COLLECTOR_IMAGE: &str = "fluent/fluent-bit:latest";

/// How long a component gets to become ready before Start gives up.
pub const READINESS_WINDOW: Duration = Duration::from_secs(120);

pub struct ComponentDeployer {
    client: kube::Client,
}

impl ComponentDeployer {
    /// Connect to the k3d cluster through its kubeconfig context
    /// (`k3d-<cluster>` as written by `k3d kubeconfig merge`).
    pub async fn connect(cluster_name: &str) -> Result<Self> {
        let options = KubeConfigOptions {
            context: Some(format!("k3d-{cluster_name}")),
            ..Default::default()
        };
        let config = kube::Config::from_kubeconfig(&options)
            .await
            .with_context(|| format!("failed to load kubeconfig for cluster {cluster_name}"))?;
        let client = kube::Client::try_from(config)
            .context("failed to build kubernetes client")?;
        Ok(Self { client })
    }

    async fn apply<K>(&self, namespace: Option<&str>, name: &str, object: &K) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::Serialize
            + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let api: Api<K> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        };
        api.patch(name, &PatchParams::apply("kecs"), &Patch::Apply(object))
            .await
            .with_context(|| format!("failed to apply {name}"))?;
        Ok(())
    }

    pub async fn ensure_namespace(&self) -> Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(SYSTEM_NAMESPACE.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(
            SYSTEM_NAMESPACE,
            &PatchParams::apply("kecs"),
            &Patch::Apply(&namespace),
        )
        .await
        .context("failed to ensure namespace")?;
        Ok(())
    }

    pub async fn namespace_exists(&self) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(SYSTEM_NAMESPACE).await?.is_some())
    }

    /// The control plane is this same binary running in server mode inside
    /// the cluster, pointed at the instance volume.
    pub async fn deploy_control_plane(&self, config: &InstanceConfig) -> Result<()> {
        let mut env = vec![
            EnvVar {
                name: "KECS_CONTAINER_MODE".to_string(),
                value: Some("true".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "KECS_DATA_DIR".to_string(),
                value: Some("/data".to_string()),
                ..Default::default()
            },
        ];
        if !config.disable_localstack {
            // Cluster-local DNS for the co-located emulator.
            env.push(EnvVar {
                name: "KECS_LOCALSTACK_ENDPOINT".to_string(),
                value: Some(format!(
                    "http://{LOCALSTACK_NAME}.{SYSTEM_NAMESPACE}.svc.cluster.local:4566"
                )),
                ..Default::default()
            });
        }
        let labels = BTreeMap::from([("app".to_string(), CONTROL_PLANE_NAME.to_string())]);
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(CONTROL_PLANE_NAME.to_string()),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: CONTROL_PLANE_NAME.to_string(),
                            image: Some(CONTROL_PLANE_IMAGE.to_string()),
                            args: Some(vec![
                                "server".to_string(),
                                "--api-port".to_string(),
                                config.api_port.to_string(),
                                "--admin-port".to_string(),
                                config.admin_port.to_string(),
                            ]),
                            env: Some(env),
                            ports: Some(vec![
                                ContainerPort {
                                    container_port: i32::from(config.api_port),
                                    ..Default::default()
                                },
                                ContainerPort {
                                    container_port: i32::from(config.admin_port),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        self.apply(Some(SYSTEM_NAMESPACE), CONTROL_PLANE_NAME, &deployment)
            .await
    }

    pub async fn deploy_localstack(&self) -> Result<()> {
        let labels = BTreeMap::from([("app".to_string(), LOCALSTACK_NAME.to_string())]);
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(LOCALSTACK_NAME.to_string()),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: LOCALSTACK_NAME.to_string(),
                            image: Some(LOCALSTACK_IMAGE.to_string()),
                            env: Some(vec![EnvVar {
                                name: "SERVICES".to_string(),
                                value: Some("iam,sts,logs,elbv2".to_string()),
                                ..Default::default()
                            }]),
                            ports: Some(vec![ContainerPort {
                                container_port: 4566,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        self.apply(Some(SYSTEM_NAMESPACE), LOCALSTACK_NAME, &deployment)
            .await
    }

    pub async fn deploy_log_collector(&self) -> Result<()> {
        let labels = BTreeMap::from([("app".to_string(), LOG_COLLECTOR_NAME.to_string())]);
        let daemon_set = DaemonSet {
            metadata: ObjectMeta {
                name: Some(LOG_COLLECTOR_NAME.to_string()),
                namespace: Some(SYSTEM_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: LOG_COLLECTOR_NAME.to_string(),
                            image: Some(LOG_COLLECTOR_IMAGE.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        self.apply(Some(SYSTEM_NAMESPACE), LOG_COLLECTOR_NAME, &daemon_set)
            .await
    }

    /// Control-plane readiness: the admin endpoint answers 200 on /health
    /// from the host within the readiness window.
    pub async fn wait_control_plane_ready(
        admin_port: u16,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = format!("http://127.0.0.1:{admin_port}/health");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("failed to build http client")?;
        kecs_common::wait::wait_until_ready(cancel, READINESS_WINDOW, "control plane", || {
            let client = client.clone();
            let url = url.clone();
            async move {
                matches!(client.get(&url).send().await, Ok(resp) if resp.status().is_success())
            }
        })
        .await
    }

    /// Pod readiness by label, for components without a host-reachable
    /// health endpoint.
    pub async fn wait_pod_ready(&self, app: &str, cancel: &CancellationToken) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        let selector = format!("app={app}");
        kecs_common::wait::wait_until_ready(cancel, READINESS_WINDOW, app, || {
            let api = api.clone();
            let selector = selector.clone();
            async move {
                let params = ListParams::default().labels(&selector);
                match api.list(&params).await {
                    Ok(pods) => pods.items.iter().any(pod_is_ready),
                    Err(_) => false,
                }
            }
        })
        .await
    }

    /// Weakest predicate: the pod merely exists. Used for the log
    /// collector, whose failures are never fatal.
    pub async fn wait_pod_exists(&self, app: &str, cancel: &CancellationToken) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), SYSTEM_NAMESPACE);
        let selector = format!("app={app}");
        kecs_common::wait::wait_until_ready(cancel, READINESS_WINDOW, app, || {
            let api = api.clone();
            let selector = selector.clone();
            async move {
                let params = ListParams::default().labels(&selector);
                matches!(api.list(&params).await, Ok(pods) if !pods.items.is_empty())
            }
        })
        .await
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}
