use serde::{Deserialize, Serialize};

/// Name/value metadata attached to a target (typically a container
/// instance). Unique on `(name, target_type, target_id, cluster)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(skip)]
    pub cluster: String,
}

pub mod target_type {
    pub const CONTAINER_INSTANCE: &str = "container-instance";
}
