//! The L7 load-balancer family mirrored from the managed data model.

use serde::{Deserialize, Serialize};

pub mod lb_type {
    pub const APPLICATION: &str = "application";
    pub const NETWORK: &str = "network";
}

pub mod target_health {
    pub const HEALTHY: &str = "healthy";
    pub const UNHEALTHY: &str = "unhealthy";
    pub const INITIAL: &str = "initial";
    pub const DRAINING: &str = "draining";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub arn: String,
    pub name: String,
    pub dns_name: String,
    pub lb_type: String,
    pub scheme: String,
    pub state: String,
    pub vpc_id: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroup {
    pub arn: String,
    pub name: String,
    pub protocol: String,
    pub port: i32,
    pub target_type: String,
    pub vpc_id: Option<String>,
    pub health_check_path: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub arn: String,
    pub load_balancer_arn: String,
    pub protocol: String,
    pub port: i32,
    pub default_target_group_arn: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub arn: String,
    pub listener_arn: String,
    pub priority: i32,
    /// Serialized condition list, uninterpreted by the core.
    pub conditions: serde_json::Value,
    pub target_group_arn: Option<String>,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

/// Registration of one backend in a target group, keyed
/// `(target_group_arn, target_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub target_group_arn: String,
    pub target_id: String,
    pub port: Option<i32>,
    pub health: String,
    /// Unix epoch timestamp in milliseconds.
    pub registered_at: i64,
}
