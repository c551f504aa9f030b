use serde::{Deserialize, Serialize};

pub mod status {
    pub const ACTIVE: &str = "ACTIVE";
    pub const INACTIVE: &str = "INACTIVE";
}

/// A logical ECS cluster within one instance. `k8s_cluster_name` back-links
/// into the Kubernetes runtime hosting its workloads and must remain valid
/// for the lifetime of the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub arn: String,
    pub name: String,
    pub status: String,
    pub region: String,
    pub account_id: String,
    pub k8s_cluster_name: String,
    pub registered_container_instances_count: i64,
    pub running_tasks_count: i64,
    pub pending_tasks_count: i64,
    pub active_services_count: i64,
    /// Opaque per-cluster emulator bookkeeping.
    pub localstack_state: Option<serde_json::Value>,
    pub settings: Option<serde_json::Value>,
    pub tags: Option<serde_json::Value>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub updated_at: i64,
}

/// The `<cluster>-<region>` namespace hosting this cluster's workloads.
pub fn namespace(cluster: &Cluster) -> String {
    format!("{}-{}", cluster.name, cluster.region)
}
