//! Wire request/response shapes for the amz-json protocol.
//!
//! All fields are camelCase on the wire; timestamps are emitted as epoch
//! seconds the way the managed service does, converted from the stored
//! millisecond values.

use kecs_types::attribute::Attribute;
use kecs_types::cluster::Cluster;
use kecs_types::service::{
    DeploymentConfiguration, LoadBalancerRef, NetworkConfiguration, Service, ServiceRegistry,
};
use kecs_types::settings::AccountSetting;
use kecs_types::task::Task;
use kecs_types::task_definition::{ContainerDefinition, TaskDefinition, Volume};
use kecs_types::task_set::{Scale, TaskSet};
use serde::{Deserialize, Serialize};

fn seconds(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

fn opt_seconds(ms: Option<i64>) -> Option<f64> {
    ms.map(seconds)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub arn: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Failure {
    pub fn missing(arn: impl Into<String>) -> Self {
        Failure {
            arn: arn.into(),
            reason: "MISSING".to_string(),
            detail: None,
        }
    }
}

// ---- Clusters ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterWire {
    pub cluster_arn: String,
    pub cluster_name: String,
    pub status: String,
    pub registered_container_instances_count: i64,
    pub running_tasks_count: i64,
    pub pending_tasks_count: i64,
    pub active_services_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
}

impl From<&Cluster> for ClusterWire {
    fn from(c: &Cluster) -> Self {
        ClusterWire {
            cluster_arn: c.arn.clone(),
            cluster_name: c.name.clone(),
            status: c.status.clone(),
            registered_container_instances_count: c.registered_container_instances_count,
            running_tasks_count: c.running_tasks_count,
            pending_tasks_count: c.pending_tasks_count,
            active_services_count: c.active_services_count,
            settings: c.settings.clone(),
            tags: c.tags.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    pub cluster: ClusterWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeClustersRequest {
    #[serde(default)]
    pub clusters: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeClustersResponse {
    pub clusters: Vec<ClusterWire>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListClustersRequest {
    pub max_results: Option<i64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListClustersResponse {
    pub cluster_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteClusterRequest {
    pub cluster: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClusterRequest {
    pub cluster: String,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

// ---- Task definitions ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTaskDefinitionRequest {
    pub family: String,
    pub network_mode: Option<String>,
    #[serde(default)]
    pub container_definitions: Vec<ContainerDefinition>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub task_role_arn: Option<String>,
    pub execution_role_arn: Option<String>,
    #[serde(default)]
    pub requires_compatibilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinitionWire {
    pub task_definition_arn: String,
    pub family: String,
    pub revision: i64,
    pub network_mode: String,
    pub container_definitions: Vec<ContainerDefinition>,
    pub volumes: Vec<Volume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_role_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_role_arn: Option<String>,
    pub requires_compatibilities: Vec<String>,
    pub status: String,
    pub registered_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deregistered_at: Option<f64>,
}

impl From<&TaskDefinition> for TaskDefinitionWire {
    fn from(td: &TaskDefinition) -> Self {
        TaskDefinitionWire {
            task_definition_arn: td.arn.clone(),
            family: td.family.clone(),
            revision: td.revision,
            network_mode: td.network_mode.clone(),
            container_definitions: td.container_definitions.clone(),
            volumes: td.volumes.clone(),
            cpu: td.cpu.clone(),
            memory: td.memory.clone(),
            task_role_arn: td.task_role_arn.clone(),
            execution_role_arn: td.execution_role_arn.clone(),
            requires_compatibilities: td.requires_compatibilities.clone(),
            status: td.status.clone(),
            registered_at: seconds(td.registered_at),
            deregistered_at: opt_seconds(td.deregistered_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinitionResponse {
    pub task_definition: TaskDefinitionWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeTaskDefinitionRequest {
    pub task_definition: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTaskDefinitionsRequest {
    pub family_prefix: Option<String>,
    pub status: Option<String>,
    pub max_results: Option<i64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTaskDefinitionsResponse {
    pub task_definition_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTaskDefinitionFamiliesRequest {
    pub family_prefix: Option<String>,
    pub status: Option<String>,
    pub max_results: Option<i64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTaskDefinitionFamiliesResponse {
    pub families: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterTaskDefinitionRequest {
    pub task_definition: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskDefinitionsRequest {
    #[serde(default)]
    pub task_definitions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskDefinitionsResponse {
    pub task_definitions: Vec<TaskDefinitionWire>,
    pub failures: Vec<Failure>,
}

// ---- Services ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    pub cluster: Option<String>,
    pub service_name: String,
    pub task_definition: String,
    pub desired_count: Option<i64>,
    pub launch_type: Option<String>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerRef>,
    #[serde(default)]
    pub service_registries: Vec<ServiceRegistry>,
    pub network_configuration: Option<NetworkConfiguration>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
    pub scheduling_strategy: Option<String>,
    pub role: Option<String>,
    pub platform_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceWire {
    pub service_arn: String,
    pub service_name: String,
    pub cluster_arn: String,
    pub task_definition: String,
    pub desired_count: i64,
    pub running_count: i64,
    pub pending_count: i64,
    pub launch_type: String,
    pub status: String,
    pub load_balancers: Vec<LoadBalancerRef>,
    pub service_registries: Vec<ServiceRegistry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_configuration: Option<NetworkConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_configuration: Option<DeploymentConfiguration>,
    pub scheduling_strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_task_set: Option<String>,
    pub created_at: f64,
}

impl From<&Service> for ServiceWire {
    fn from(s: &Service) -> Self {
        ServiceWire {
            service_arn: s.arn.clone(),
            service_name: s.service_name.clone(),
            cluster_arn: s.cluster_arn.clone(),
            task_definition: s.task_definition_arn.clone(),
            desired_count: s.desired_count,
            running_count: s.running_count,
            pending_count: s.pending_count,
            launch_type: s.launch_type.clone(),
            status: s.status.clone(),
            load_balancers: s.load_balancers.clone(),
            service_registries: s.service_registries.clone(),
            network_configuration: s.network_configuration.clone(),
            deployment_configuration: s.deployment_configuration.clone(),
            scheduling_strategy: s.scheduling_strategy.clone(),
            platform_version: s.platform_version.clone(),
            primary_task_set: s.primary_task_set.clone(),
            created_at: seconds(s.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub service: ServiceWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServiceRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub desired_count: Option<i64>,
    pub task_definition: Option<String>,
    pub network_configuration: Option<NetworkConfiguration>,
    pub deployment_configuration: Option<DeploymentConfiguration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteServiceRequest {
    pub cluster: Option<String>,
    pub service: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeServicesRequest {
    pub cluster: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeServicesResponse {
    pub services: Vec<ServiceWire>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListServicesRequest {
    pub cluster: Option<String>,
    pub launch_type: Option<String>,
    pub max_results: Option<i64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListServicesResponse {
    pub service_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

// ---- Tasks ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    pub cluster: Option<String>,
    pub task_definition: String,
    pub count: Option<i64>,
    pub started_by: Option<String>,
    pub launch_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_arn: Option<String>,
    pub task_arn: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub last_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskWire {
    pub task_arn: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_instance_arn: Option<String>,
    pub last_status: String,
    pub desired_status: String,
    pub containers: Vec<ContainerWire>,
    pub launch_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_stopped_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopping_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_stopped_at: Option<f64>,
    pub created_at: f64,
    pub version: i64,
}

impl From<&Task> for TaskWire {
    fn from(t: &Task) -> Self {
        TaskWire {
            task_arn: t.arn.clone(),
            cluster_arn: t.cluster_arn.clone(),
            task_definition_arn: t.task_definition_arn.clone(),
            container_instance_arn: t.container_instance_arn.clone(),
            last_status: t.last_status.clone(),
            desired_status: t.desired_status.clone(),
            containers: t
                .containers
                .iter()
                .map(|c| ContainerWire {
                    container_arn: c.container_arn.clone(),
                    task_arn: t.arn.clone(),
                    name: c.name.clone(),
                    image: c.image.clone(),
                    last_status: c.last_status.clone(),
                    exit_code: c.exit_code,
                    reason: c.reason.clone(),
                })
                .collect(),
            launch_type: t.launch_type.clone(),
            started_by: t.started_by.clone(),
            stopped_reason: t.stopped_reason.clone(),
            stop_code: t.stop_code.clone(),
            connectivity: t.connectivity.clone(),
            pull_started_at: opt_seconds(t.pull_started_at),
            pull_stopped_at: opt_seconds(t.pull_stopped_at),
            started_at: opt_seconds(t.started_at),
            stopping_at: opt_seconds(t.stopping_at),
            stopped_at: opt_seconds(t.stopped_at),
            execution_stopped_at: opt_seconds(t.execution_stopped_at),
            created_at: seconds(t.created_at),
            version: t.version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskResponse {
    pub tasks: Vec<TaskWire>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTaskRequest {
    pub cluster: Option<String>,
    pub task: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTaskResponse {
    pub task: TaskWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeTasksRequest {
    pub cluster: Option<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeTasksResponse {
    pub tasks: Vec<TaskWire>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksRequest {
    pub cluster: Option<String>,
    pub service_name: Option<String>,
    pub desired_status: Option<String>,
    pub launch_type: Option<String>,
    pub started_by: Option<String>,
    pub max_results: Option<i64>,
    pub next_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResponse {
    pub task_arns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

// ---- Task sets ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskSetRequest {
    pub service: String,
    pub cluster: Option<String>,
    pub external_id: Option<String>,
    pub task_definition: String,
    pub network_configuration: Option<NetworkConfiguration>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerRef>,
    #[serde(default)]
    pub service_registries: Vec<ServiceRegistry>,
    pub launch_type: Option<String>,
    pub scale: Option<Scale>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSetWire {
    pub id: String,
    pub task_set_arn: String,
    pub service_arn: String,
    pub cluster_arn: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub task_definition: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
    pub computed_desired_count: i64,
    pub running_count: i64,
    pub pending_count: i64,
    pub status: String,
    pub stability_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_configuration: Option<NetworkConfiguration>,
    pub load_balancers: Vec<LoadBalancerRef>,
    pub service_registries: Vec<ServiceRegistry>,
    pub launch_type: String,
    pub created_at: f64,
    pub updated_at: f64,
}

impl From<&TaskSet> for TaskSetWire {
    fn from(ts: &TaskSet) -> Self {
        TaskSetWire {
            id: ts.id.clone(),
            task_set_arn: ts.arn.clone(),
            service_arn: ts.service_arn.clone(),
            cluster_arn: ts.cluster_arn.clone(),
            external_id: ts.external_id.clone(),
            task_definition: ts.task_definition.clone(),
            scale: ts.scale.clone(),
            computed_desired_count: ts.computed_desired_count,
            running_count: ts.running_count,
            pending_count: ts.pending_count,
            status: ts.status.clone(),
            stability_status: ts.stability_status.clone(),
            network_configuration: ts.network_configuration.clone(),
            load_balancers: ts.load_balancers.clone(),
            service_registries: ts.service_registries.clone(),
            launch_type: ts.launch_type.clone(),
            created_at: seconds(ts.created_at),
            updated_at: seconds(ts.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSetResponse {
    pub task_set: TaskSetWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_set: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeTaskSetsRequest {
    pub cluster: Option<String>,
    pub service: String,
    #[serde(default)]
    pub task_sets: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeTaskSetsResponse {
    pub task_sets: Vec<TaskSetWire>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServicePrimaryTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub primary_task_set: String,
}

// ---- Attributes ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutAttributesRequest {
    pub cluster: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributesResponse {
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAttributesRequest {
    pub cluster: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAttributesRequest {
    pub cluster: Option<String>,
    pub target_type: Option<String>,
    pub attribute_name: Option<String>,
}

// ---- Account settings ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutAccountSettingRequest {
    pub name: String,
    pub value: String,
    pub principal_arn: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettingResponse {
    pub setting: AccountSetting,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAccountSettingsRequest {
    pub name: Option<String>,
    pub principal_arn: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListAccountSettingsResponse {
    pub settings: Vec<AccountSetting>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAccountSettingRequest {
    pub name: String,
    pub principal_arn: Option<String>,
}
