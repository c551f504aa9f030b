use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    EndpointPort, EndpointSubset, Endpoints, Pod, PodSpec, PodTemplateSpec, Service as K8sService,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kecs_types::cluster::Cluster;
use kecs_types::elbv2::lb_type;
use kecs_types::service::Service;
use kecs_types::task::Task;
use kecs_types::task_definition::{TaskDefinition, network_mode};
use kecs_types::task_set::TaskSet;

use crate::{
    ANNOTATION_HOST_PORT_PREFIX, ANNOTATION_NETWORK_CONFIGURATION, ANNOTATION_SCHEDULING_STRATEGY,
    ANNOTATION_SERVICE_ARN, ANNOTATION_TASK_ARN, ANNOTATION_TASK_DEFINITION_ARN,
    ANNOTATION_TASK_SET_ARN, ConvertError, LABEL_APP, LABEL_CLUSTER, LABEL_MANAGED_BY,
    LABEL_SERVICE, LABEL_TASK_SET, MANAGED_BY, container::convert_container,
    registry::extract_service_discovery_ids, volume::convert_volumes,
};

fn validate_network_mode(td: &TaskDefinition) -> Result<(), ConvertError> {
    match td.network_mode.as_str() {
        network_mode::AWSVPC | network_mode::BRIDGE | network_mode::HOST | network_mode::NONE => {
            Ok(())
        }
        other => Err(ConvertError::InvalidNetworkMode(other.to_string())),
    }
}

fn base_labels(service_name: &str, cluster: &Cluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), service_name.to_string());
    labels.insert(LABEL_SERVICE.to_string(), service_name.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster.name.clone());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels
}

/// Host ports never land in the pod spec; the local runtime allocates
/// them. They are recorded as annotations for downstream consumers.
fn host_port_annotations(td: &TaskDefinition, annotations: &mut BTreeMap<String, String>) {
    for def in &td.container_definitions {
        let Some(container) = def.name.as_deref() else {
            continue;
        };
        for pm in &def.port_mappings {
            if let (Some(container_port), Some(host_port)) = (pm.container_port, pm.host_port) {
                annotations.insert(
                    format!("{ANNOTATION_HOST_PORT_PREFIX}.{container}.{container_port}"),
                    host_port.to_string(),
                );
            }
        }
    }
}

fn pod_spec(td: &TaskDefinition) -> Result<PodSpec, ConvertError> {
    validate_network_mode(td)?;
    let containers = td
        .container_definitions
        .iter()
        .map(|def| convert_container(def, &td.volumes))
        .collect::<Result<Vec<_>, _>>()?;
    let volumes = convert_volumes(&td.volumes);
    Ok(PodSpec {
        containers,
        volumes: if volumes.is_empty() {
            None
        } else {
            Some(volumes)
        },
        host_network: (td.network_mode == network_mode::HOST).then_some(true),
        ..Default::default()
    })
}

/// Produce the Deployment backing a service: replicas follow
/// `desired_count`, rolling update at 25%/25%. DAEMON services still
/// yield a Deployment rather than a DaemonSet; this matches the source's
/// observable behavior and is a documented deviation.
pub fn deployment_for_service(
    service: &Service,
    td: &TaskDefinition,
    cluster: &Cluster,
) -> Result<Deployment, ConvertError> {
    let labels = base_labels(&service.service_name, cluster);
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_SERVICE_ARN.to_string(), service.arn.clone());
    annotations.insert(ANNOTATION_TASK_DEFINITION_ARN.to_string(), td.arn.clone());
    annotations.insert(
        ANNOTATION_SCHEDULING_STRATEGY.to_string(),
        service.scheduling_strategy.clone(),
    );
    if let Some(nc) = &service.network_configuration {
        annotations.insert(
            ANNOTATION_NETWORK_CONFIGURATION.to_string(),
            serde_json::to_string(nc).unwrap_or_default(),
        );
    }
    host_port_annotations(td, &mut annotations);

    let selector = BTreeMap::from([(LABEL_APP.to_string(), service.service_name.clone())]);
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(service.service_name.clone()),
            namespace: Some(kecs_types::cluster::namespace(cluster)),
            labels: Some(labels.clone()),
            annotations: Some(annotations.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(service.desired_count as i32),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::String("25%".to_string())),
                    max_surge: Some(IntOrString::String("25%".to_string())),
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec(td)?),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// A Kubernetes Service is emitted only when the source service has load
/// balancer attachments AND at least one container declares a port
/// mapping. Its type is LoadBalancer for application/network balancers,
/// ClusterIP otherwise.
pub fn kubernetes_service_for_service(
    service: &Service,
    td: &TaskDefinition,
    cluster: &Cluster,
    balancer_type: Option<&str>,
) -> Result<Option<K8sService>, ConvertError> {
    if service.load_balancers.is_empty() {
        return Ok(None);
    }
    let ports: Vec<ServicePort> = td
        .container_definitions
        .iter()
        .flat_map(|def| def.port_mappings.iter())
        .filter_map(|pm| {
            pm.container_port.map(|port| ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: pm.protocol.as_deref().map(|p| p.to_uppercase()),
                ..Default::default()
            })
        })
        .collect();
    if ports.is_empty() {
        return Ok(None);
    }

    let service_type = match balancer_type {
        Some(lb_type::APPLICATION) | Some(lb_type::NETWORK) => "LoadBalancer",
        _ => "ClusterIP",
    };
    let selector = BTreeMap::from([(LABEL_APP.to_string(), service.service_name.clone())]);
    Ok(Some(K8sService {
        metadata: ObjectMeta {
            name: Some(service.service_name.clone()),
            namespace: Some(kecs_types::cluster::namespace(cluster)),
            labels: Some(base_labels(&service.service_name, cluster)),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_SERVICE_ARN.to_string(),
                service.arn.clone(),
            )])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(selector),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// A task set deploys as a color-labeled Deployment named after the
/// service and the task-set id, selected separately from the service's
/// stable color.
pub fn deployment_for_task_set(
    task_set: &TaskSet,
    service: &Service,
    td: &TaskDefinition,
    cluster: &Cluster,
) -> Result<Deployment, ConvertError> {
    let mut deployment = deployment_for_service(service, td, cluster)?;
    let name = format!("{}-{}", service.service_name, task_set.id);
    deployment.metadata.name = Some(name.clone());

    let color = BTreeMap::from([
        (LABEL_APP.to_string(), service.service_name.clone()),
        (LABEL_TASK_SET.to_string(), task_set.id.clone()),
    ]);
    if let Some(labels) = deployment.metadata.labels.as_mut() {
        labels.insert(LABEL_TASK_SET.to_string(), task_set.id.clone());
    }
    if let Some(annotations) = deployment.metadata.annotations.as_mut() {
        annotations.insert(ANNOTATION_TASK_SET_ARN.to_string(), task_set.arn.clone());
    }
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = Some(task_set.computed_desired_count as i32);
        spec.selector = LabelSelector {
            match_labels: Some(color.clone()),
            ..Default::default()
        };
        if let Some(meta) = spec.template.metadata.as_mut() {
            if let Some(labels) = meta.labels.as_mut() {
                labels.insert(LABEL_TASK_SET.to_string(), task_set.id.clone());
            }
            if let Some(annotations) = meta.annotations.as_mut() {
                annotations.insert(ANNOTATION_TASK_SET_ARN.to_string(), task_set.arn.clone());
            }
        }
    }
    Ok(deployment)
}

/// Service-discovery registrations materialize as dedicated Endpoints
/// objects; the subset ports come from each registry's containerPort.
/// Addresses fill in as pods land; conversion emits the port skeleton.
pub fn endpoints_for_task_set(task_set: &TaskSet, cluster: &Cluster) -> Vec<Endpoints> {
    task_set
        .service_registries
        .iter()
        .filter_map(|registry| {
            let registry_arn = registry.registry_arn.as_deref()?;
            let ids = extract_service_discovery_ids(registry_arn);
            let name = ids.service_id?;
            let port = registry.container_port?;
            Some(Endpoints {
                metadata: ObjectMeta {
                    name: Some(name),
                    namespace: Some(kecs_types::cluster::namespace(cluster)),
                    labels: Some(BTreeMap::from([
                        (LABEL_TASK_SET.to_string(), task_set.id.clone()),
                        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
                    ])),
                    ..Default::default()
                },
                subsets: Some(vec![EndpointSubset {
                    ports: Some(vec![EndpointPort {
                        port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }]),
            })
        })
        .collect()
}

pub fn pod_name_for_task(task_id: &str) -> String {
    let short: String = task_id.chars().filter(|c| *c != '-').take(12).collect();
    format!("task-{short}")
}

/// A standalone task wraps the same container mapping in a bare Pod.
pub fn pod_for_task(
    task: &Task,
    td: &TaskDefinition,
    cluster: &Cluster,
) -> Result<Pod, ConvertError> {
    let name = pod_name_for_task(&task.id);
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), name.clone());
    labels.insert(LABEL_CLUSTER.to_string(), cluster.name.clone());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_TASK_ARN.to_string(), task.arn.clone());
    annotations.insert(ANNOTATION_TASK_DEFINITION_ARN.to_string(), td.arn.clone());
    host_port_annotations(td, &mut annotations);

    let mut spec = pod_spec(td)?;
    spec.restart_policy = Some("Never".to_string());
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(kecs_types::cluster::namespace(cluster)),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kecs_types::service::{LoadBalancerRef, NetworkConfiguration, scheduling_strategy};
    use kecs_types::task_definition::{ContainerDefinition, PortMapping};
    use kecs_types::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION, arn};

    fn cluster() -> Cluster {
        Cluster {
            id: "c1".to_string(),
            arn: arn::cluster(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default"),
            name: "default".to_string(),
            status: "ACTIVE".to_string(),
            region: DEFAULT_REGION.to_string(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            k8s_cluster_name: "kecs-brisk-otter".to_string(),
            registered_container_instances_count: 0,
            running_tasks_count: 0,
            pending_tasks_count: 0,
            active_services_count: 0,
            localstack_state: None,
            settings: None,
            tags: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn task_definition() -> TaskDefinition {
        TaskDefinition {
            id: "td1".to_string(),
            arn: arn::task_definition(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "web", 1),
            family: "web".to_string(),
            revision: 1,
            network_mode: network_mode::AWSVPC.to_string(),
            container_definitions: vec![ContainerDefinition {
                name: Some("app".to_string()),
                image: Some("nginx:latest".to_string()),
                cpu: 256,
                memory: Some(512),
                port_mappings: vec![PortMapping {
                    container_port: Some(8080),
                    host_port: Some(30080),
                    protocol: Some("tcp".to_string()),
                    name: None,
                }],
                ..Default::default()
            }],
            volumes: Vec::new(),
            cpu: None,
            memory: None,
            task_role_arn: None,
            execution_role_arn: None,
            requires_compatibilities: Vec::new(),
            status: "ACTIVE".to_string(),
            registered_at: 0,
            deregistered_at: None,
        }
    }

    fn service(lbs: Vec<LoadBalancerRef>) -> Service {
        Service {
            id: "s1".to_string(),
            arn: arn::service(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default", "web"),
            service_name: "web".to_string(),
            cluster_arn: arn::cluster(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default"),
            task_definition_arn: arn::task_definition(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "web", 1),
            desired_count: 3,
            running_count: 0,
            pending_count: 0,
            launch_type: "FARGATE".to_string(),
            status: "ACTIVE".to_string(),
            load_balancers: lbs,
            service_registries: Vec::new(),
            network_configuration: Some(NetworkConfiguration {
                awsvpc_configuration: None,
            }),
            deployment_configuration: None,
            scheduling_strategy: scheduling_strategy::REPLICA.to_string(),
            role_arn: None,
            platform_version: None,
            primary_task_set: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn deployment_shape() {
        let deployment =
            deployment_for_service(&service(Vec::new()), &task_definition(), &cluster()).unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("web"));
        assert_eq!(
            deployment.metadata.namespace.as_deref(),
            Some("default-us-east-1")
        );
        let labels = deployment.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_APP], "web");
        assert_eq!(labels[LABEL_CLUSTER], "default");
        assert_eq!(labels[LABEL_MANAGED_BY], "kecs");

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        let strategy = spec.strategy.as_ref().unwrap();
        let rolling = strategy.rolling_update.as_ref().unwrap();
        assert_eq!(
            rolling.max_unavailable,
            Some(IntOrString::String("25%".to_string()))
        );
        assert_eq!(
            rolling.max_surge,
            Some(IntOrString::String("25%".to_string()))
        );

        let annotations = deployment.metadata.annotations.as_ref().unwrap();
        assert!(annotations[ANNOTATION_SERVICE_ARN].ends_with("service/default/web"));
        assert!(annotations.contains_key(ANNOTATION_NETWORK_CONFIGURATION));
        // Host port recorded in annotations, not the pod spec.
        assert_eq!(annotations["kecs.dev/host-port.app.8080"], "30080");
    }

    #[test]
    fn daemon_strategy_still_emits_deployment() {
        let mut svc = service(Vec::new());
        svc.scheduling_strategy = scheduling_strategy::DAEMON.to_string();
        let deployment = deployment_for_service(&svc, &task_definition(), &cluster()).unwrap();
        // Known simplification: DAEMON does not become a DaemonSet.
        assert!(deployment.spec.unwrap().strategy.is_some());
    }

    #[test]
    fn kubernetes_service_requires_lbs_and_ports() {
        let td = task_definition();
        let c = cluster();
        // No load balancers: nothing emitted.
        assert!(
            kubernetes_service_for_service(&service(Vec::new()), &td, &c, None)
                .unwrap()
                .is_none()
        );
        // Load balancer but no ports: nothing emitted.
        let mut portless = td.clone();
        portless.container_definitions[0].port_mappings.clear();
        let lbs = vec![LoadBalancerRef {
            target_group_arn: Some("arn:tg".to_string()),
            load_balancer_name: None,
            container_name: Some("app".to_string()),
            container_port: Some(8080),
        }];
        assert!(
            kubernetes_service_for_service(&service(lbs.clone()), &portless, &c, None)
                .unwrap()
                .is_none()
        );
        // Both present: emitted, type depends on balancer kind.
        let svc = kubernetes_service_for_service(
            &service(lbs.clone()),
            &td,
            &c,
            Some(lb_type::APPLICATION),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            svc.spec.as_ref().unwrap().type_.as_deref(),
            Some("LoadBalancer")
        );
        let svc = kubernetes_service_for_service(&service(lbs), &td, &c, None)
            .unwrap()
            .unwrap();
        assert_eq!(
            svc.spec.as_ref().unwrap().type_.as_deref(),
            Some("ClusterIP")
        );
    }

    #[test]
    fn task_set_deployment_is_color_labeled() {
        let svc = service(Vec::new());
        let ts = TaskSet {
            id: "ts-blue".to_string(),
            arn: arn::task_set(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default", "web", "ts-blue"),
            service_arn: svc.arn.clone(),
            cluster_arn: svc.cluster_arn.clone(),
            external_id: None,
            task_definition: svc.task_definition_arn.clone(),
            scale: None,
            computed_desired_count: 2,
            running_count: 0,
            pending_count: 0,
            status: "ACTIVE".to_string(),
            stability_status: "STABILIZING".to_string(),
            network_configuration: None,
            load_balancers: Vec::new(),
            service_registries: vec![kecs_types::service::ServiceRegistry {
                registry_arn: Some(
                    "arn:aws:servicediscovery:us-east-1:000000000000:namespace/ns-1/service/srv-9"
                        .to_string(),
                ),
                port: None,
                container_name: Some("app".to_string()),
                container_port: Some(8080),
            }],
            launch_type: "FARGATE".to_string(),
            created_at: 0,
            updated_at: 0,
        };
        let deployment =
            deployment_for_task_set(&ts, &svc, &task_definition(), &cluster()).unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("web-ts-blue"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector[LABEL_TASK_SET], "ts-blue");

        let endpoints = endpoints_for_task_set(&ts, &cluster());
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].metadata.name.as_deref(), Some("srv-9"));
        let subset = &endpoints[0].subsets.as_ref().unwrap()[0];
        assert_eq!(subset.ports.as_ref().unwrap()[0].port, 8080);
    }

    #[test]
    fn pod_for_task_shape() {
        let td = task_definition();
        let task = Task {
            id: "0123456789abcdef".to_string(),
            arn: arn::task(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default", "0123456789abcdef"),
            cluster_arn: arn::cluster(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default"),
            task_definition_arn: td.arn.clone(),
            container_instance_arn: None,
            last_status: "PROVISIONING".to_string(),
            desired_status: "RUNNING".to_string(),
            containers: Vec::new(),
            launch_type: "FARGATE".to_string(),
            started_by: None,
            stopped_reason: None,
            stop_code: None,
            connectivity: None,
            pull_started_at: None,
            pull_stopped_at: None,
            started_at: None,
            stopping_at: None,
            stopped_at: None,
            execution_stopped_at: None,
            pod_name: None,
            namespace: None,
            version: 1,
            created_at: 0,
        };
        let pod = pod_for_task(&task, &td, &cluster()).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("task-0123456789ab"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("default-us-east-1"));
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);
    }

    #[test]
    fn invalid_network_mode_rejected() {
        let mut td = task_definition();
        td.network_mode = "overlay".to_string();
        let err = deployment_for_service(&service(Vec::new()), &td, &cluster()).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidNetworkMode(_)));
    }

    #[test]
    fn conversion_is_deterministic() {
        let a = deployment_for_service(&service(Vec::new()), &task_definition(), &cluster())
            .unwrap();
        let b = deployment_for_service(&service(Vec::new()), &task_definition(), &cluster())
            .unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
