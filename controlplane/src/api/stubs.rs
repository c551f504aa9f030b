//! Permissive stubs for operations agents and SDKs probe but the emulator
//! does not model. Each returns a minimally well-formed body so callers
//! proceed instead of erroring.

use kecs_types::Error;

use crate::state::AppState;

pub async fn handle(
    state: &AppState,
    operation: &str,
    payload: serde_json::Value,
) -> Result<serde_json::Value, Error> {
    tracing::debug!(%operation, "stubbed operation");
    Ok(match operation {
        "DiscoverPollEndpoint" => serde_json::json!({
            "endpoint": "http://localhost",
            "telemetryEndpoint": "http://localhost",
        }),
        "GetTaskProtection" | "UpdateTaskProtection" => {
            let task = payload
                .get("tasks")
                .and_then(|t| t.get(0))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            serde_json::json!({
                "protectedTasks": [{
                    "taskArn": task,
                    "protectionEnabled": false,
                }],
                "failures": [],
            })
        }
        "StartTask" => serde_json::json!({ "tasks": [], "failures": [] }),
        "SubmitTaskStateChange" | "SubmitAttachmentStateChanges" => {
            serde_json::json!({ "acknowledgment": "ACK" })
        }
        "PutClusterCapacityProviders" | "UpdateClusterSettings" => {
            // Echo the cluster back so callers that read it stay happy.
            let cluster = payload
                .get("cluster")
                .and_then(|c| c.as_str())
                .unwrap_or("default");
            match state.db.clusters().get(cluster).await {
                Ok(c) => serde_json::json!({
                    "cluster": {
                        "clusterArn": c.arn,
                        "clusterName": c.name,
                        "status": c.status,
                    }
                }),
                Err(_) => serde_json::json!({}),
            }
        }
        // ExecuteCommand and anything else stubbed: empty body.
        _ => serde_json::json!({}),
    })
}
