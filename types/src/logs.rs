use serde::{Deserialize, Serialize};

/// One captured log line from a task's container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: Option<i64>,
    pub task_arn: String,
    pub container_name: String,
    /// Unix epoch timestamp in milliseconds.
    pub timestamp: i64,
    pub log_line: String,
    pub log_level: String,
    /// Unix epoch timestamp in milliseconds.
    pub created_at: i64,
}

/// Filter for log queries. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskLogFilter {
    pub task_arn: Option<String>,
    pub container_name: Option<String>,
    pub log_level: Option<String>,
    /// Substring match on the log line.
    pub search: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
