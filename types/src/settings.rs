use serde::{Deserialize, Serialize};

/// Per-principal account setting. Unique on `(principal_arn, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSetting {
    pub name: String,
    pub value: String,
    pub principal_arn: String,
}
