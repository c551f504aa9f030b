//! Log group/stream lifecycle against the CloudWatch Logs emulator.
//! Creation calls are idempotent: an already-exists answer is success.

use anyhow::{Context, Result, bail};
use kecs_types::arn;

/// Log groups live under this prefix, one per cluster.
pub const LOG_GROUP_PREFIX: &str = "/ecs/";
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

const TARGET_CREATE_GROUP: &str = "Logs_20140328.CreateLogGroup";
const TARGET_CREATE_STREAM: &str = "Logs_20140328.CreateLogStream";
const TARGET_DELETE_GROUP: &str = "Logs_20140328.DeleteLogGroup";
const TARGET_PUT_RETENTION: &str = "Logs_20140328.PutRetentionPolicy";

/// `/ecs/<cluster>` derived from the task ARN's resource path.
pub fn log_group_for(task_arn: &str) -> String {
    let cluster = arn::parse(task_arn)
        .ok()
        .and_then(|parsed| {
            parsed
                .resource
                .split('/')
                .nth(1)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "default".to_string());
    format!("{LOG_GROUP_PREFIX}{cluster}")
}

/// `<task-id>/<container>` within the task's group.
pub fn log_stream_for(task_arn: &str, container: &str) -> String {
    format!("{}/{container}", arn::resource_name(task_arn))
}

pub struct LogAdapter {
    endpoint: String,
    http: reqwest::Client,
}

impl LogAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: super::provider_client(),
        }
    }

    async fn call(
        &self,
        target: &str,
        body: serde_json::Value,
        tolerate_exists: bool,
    ) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-amz-target", target)
            .header(http::header::CONTENT_TYPE, "application/x-amz-json-1.1")
            .body(body.to_string())
            .send()
            .await
            .context("log provider unreachable")?;
        if response.status().is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if tolerate_exists && text.contains("ResourceAlreadyExistsException") {
            return Ok(());
        }
        bail!("{target} failed: {text}");
    }

    pub async fn ensure_log_group(&self, group: &str) -> Result<()> {
        self.call(
            TARGET_CREATE_GROUP,
            serde_json::json!({ "logGroupName": group }),
            true,
        )
        .await?;
        // Retention is applied on every ensure; the call is idempotent.
        self.call(
            TARGET_PUT_RETENTION,
            serde_json::json!({
                "logGroupName": group,
                "retentionInDays": DEFAULT_RETENTION_DAYS,
            }),
            true,
        )
        .await
    }

    pub async fn ensure_log_stream(&self, group: &str, stream: &str) -> Result<()> {
        self.call(
            TARGET_CREATE_STREAM,
            serde_json::json!({ "logGroupName": group, "logStreamName": stream }),
            true,
        )
        .await
    }

    pub async fn delete_log_group(&self, group: &str) -> Result<()> {
        self.call(
            TARGET_DELETE_GROUP,
            serde_json::json!({ "logGroupName": group }),
            false,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_derive_from_arn_parts() {
        let task_arn = "arn:aws:ecs:us-east-1:000000000000:task/default/abc123";
        assert_eq!(log_group_for(task_arn), "/ecs/default");
        assert_eq!(log_stream_for(task_arn, "app"), "abc123/app");
    }

    #[test]
    fn unparseable_arn_falls_back() {
        assert_eq!(log_group_for("abc123"), "/ecs/default");
        assert_eq!(log_stream_for("abc123", "app"), "abc123/app");
    }
}
