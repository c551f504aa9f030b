use serde::{Deserialize, Serialize};

pub mod status {
    pub const PRIMARY: &str = "PRIMARY";
    pub const ACTIVE: &str = "ACTIVE";
    pub const DRAINING: &str = "DRAINING";
}

pub mod stability_status {
    pub const STEADY_STATE: &str = "STEADY_STATE";
    pub const STABILIZING: &str = "STABILIZING";
}

/// Alternate color inside a Service supporting blue/green and canary-style
/// deployments. The primary task set is tracked on the owning Service row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSet {
    pub id: String,
    pub arn: String,
    pub service_arn: String,
    pub cluster_arn: String,
    pub external_id: Option<String>,
    pub task_definition: String,
    pub scale: Option<Scale>,
    pub computed_desired_count: i64,
    pub running_count: i64,
    pub pending_count: i64,
    pub status: String,
    pub stability_status: String,
    pub network_configuration: Option<crate::service::NetworkConfiguration>,
    pub load_balancers: Vec<crate::service::LoadBalancerRef>,
    pub service_registries: Vec<crate::service::ServiceRegistry>,
    pub launch_type: String,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
    /// Unix epoch timestamp in milliseconds.
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    pub value: Option<f64>,
    pub unit: Option<String>,
}
