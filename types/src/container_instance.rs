use serde::{Deserialize, Serialize};

pub mod status {
    pub const ACTIVE: &str = "ACTIVE";
    pub const DRAINING: &str = "DRAINING";
    pub const INACTIVE: &str = "INACTIVE";
}

/// Mostly synthetic for wire compatibility; populated when external nodes
/// register themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInstance {
    pub arn: String,
    pub cluster_arn: String,
    pub ec2_instance_id: String,
    pub status: String,
    pub agent_connected: bool,
    pub running_tasks_count: i64,
    pub pending_tasks_count: i64,
    pub registered_resources: Option<serde_json::Value>,
    pub remaining_resources: Option<serde_json::Value>,
    pub version_info: Option<serde_json::Value>,
    pub attributes: Option<serde_json::Value>,
    /// Unix epoch timestamp in milliseconds.
    pub registered_at: i64,
    pub deregistered_at: Option<i64>,
}
