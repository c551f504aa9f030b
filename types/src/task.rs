use serde::{Deserialize, Serialize};

/// Task state machine statuses. `last_status` advances
/// PROVISIONING -> PENDING -> RUNNING -> STOPPED; `desired_status` is only
/// ever RUNNING or STOPPED.
pub mod status {
    pub const PROVISIONING: &str = "PROVISIONING";
    pub const PENDING: &str = "PENDING";
    pub const RUNNING: &str = "RUNNING";
    pub const STOPPED: &str = "STOPPED";
}

pub mod stop_code {
    pub const USER_INITIATED: &str = "TaskStoppedByUser";
    pub const ESSENTIAL_CONTAINER_EXITED: &str = "EssentialContainerExited";
}

pub mod connectivity {
    pub const CONNECTED: &str = "CONNECTED";
}

/// One running (or terminal) instance of a task definition, backed by one
/// Kubernetes pod. `version` increments on every mutation; updates are
/// compare-and-set on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub arn: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    pub container_instance_arn: Option<String>,
    pub last_status: String,
    pub desired_status: String,
    pub containers: Vec<ContainerSnapshot>,
    pub launch_type: String,
    pub started_by: Option<String>,
    pub stopped_reason: Option<String>,
    pub stop_code: Option<String>,
    pub connectivity: Option<String>,
    pub pull_started_at: Option<i64>,
    pub pull_stopped_at: Option<i64>,
    pub started_at: Option<i64>,
    pub stopping_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub execution_stopped_at: Option<i64>,
    /// Back-link into the Kubernetes runtime.
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub version: i64,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

/// Point-in-time view of one container within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSnapshot {
    pub container_arn: Option<String>,
    pub name: String,
    pub image: Option<String>,
    pub last_status: String,
    pub exit_code: Option<i64>,
    pub reason: Option<String>,
}

impl Task {
    /// Whether the reconciler still owes this task a transition.
    pub fn is_settled(&self) -> bool {
        self.last_status == status::STOPPED
    }
}
