use deadpool_sqlite::Pool;
use kecs_types::Result;
use kecs_types::logs::{TaskLog, TaskLogFilter};
use rusqlite::params;

use crate::{db_err, run};

#[derive(Clone)]
pub struct TaskLogStore {
    pool: Pool,
}

impl TaskLogStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Batch insert; one transaction per batch.
    pub async fn save_logs(&self, logs: Vec<TaskLog>) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for log in logs {
                tx.prepare_cached(
                    "INSERT INTO task_logs (task_arn, container_name, timestamp, log_line, \
                     log_level, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(db_err)?
                .execute(params![
                    log.task_arn,
                    log.container_name,
                    log.timestamp,
                    log.log_line,
                    log.log_level,
                    log.created_at,
                ])
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn get_logs(&self, filter: TaskLogFilter) -> Result<Vec<TaskLog>> {
        run(&self.pool, move |conn| {
            let mut sql = String::from(
                "SELECT id, task_arn, container_name, timestamp, log_line, log_level, \
                 created_at FROM task_logs WHERE 1 = 1",
            );
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
            if let Some(task) = &filter.task_arn {
                sql.push_str(&format!(" AND task_arn = ?{}", values.len() + 1));
                values.push(Box::new(task.clone()));
            }
            if let Some(container) = &filter.container_name {
                sql.push_str(&format!(" AND container_name = ?{}", values.len() + 1));
                values.push(Box::new(container.clone()));
            }
            if let Some(level) = &filter.log_level {
                sql.push_str(&format!(" AND log_level = ?{}", values.len() + 1));
                values.push(Box::new(level.clone()));
            }
            if let Some(search) = &filter.search {
                sql.push_str(&format!(" AND log_line LIKE ?{}", values.len() + 1));
                values.push(Box::new(format!("%{search}%")));
            }
            if let Some(from) = filter.from {
                sql.push_str(&format!(" AND timestamp >= ?{}", values.len() + 1));
                values.push(Box::new(from));
            }
            if let Some(to) = filter.to {
                sql.push_str(&format!(" AND timestamp <= ?{}", values.len() + 1));
                values.push(Box::new(to));
            }
            sql.push_str(&format!(
                " ORDER BY timestamp, id LIMIT ?{} OFFSET ?{}",
                values.len() + 1,
                values.len() + 2
            ));
            values.push(Box::new(filter.limit.unwrap_or(1000).clamp(1, 10_000)));
            values.push(Box::new(filter.offset.unwrap_or(0).max(0)));

            let mut stmt = conn.prepare_cached(&sql).map_err(db_err)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt.query(params_ref.as_slice()).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(TaskLog {
                    id: row.get(0).map_err(db_err)?,
                    task_arn: row.get(1).map_err(db_err)?,
                    container_name: row.get(2).map_err(db_err)?,
                    timestamp: row.get(3).map_err(db_err)?,
                    log_line: row.get(4).map_err(db_err)?,
                    log_level: row.get(5).map_err(db_err)?,
                    created_at: row.get(6).map_err(db_err)?,
                });
            }
            Ok(out)
        })
        .await
    }

    /// Age-based retention: drop everything created before `cutoff_ms`.
    /// Returns the number of deleted rows.
    pub async fn delete_old_logs(&self, cutoff_ms: i64) -> Result<u64> {
        run(&self.pool, move |conn| {
            let deleted = conn
                .prepare_cached("DELETE FROM task_logs WHERE created_at < ?1")
                .map_err(db_err)?
                .execute(params![cutoff_ms])
                .map_err(db_err)?;
            Ok(deleted as u64)
        })
        .await
    }

    pub async fn delete_task_logs(&self, task_arn: &str) -> Result<u64> {
        let task_arn = task_arn.to_string();
        run(&self.pool, move |conn| {
            let deleted = conn
                .prepare_cached("DELETE FROM task_logs WHERE task_arn = ?1")
                .map_err(db_err)?
                .execute(params![task_arn])
                .map_err(db_err)?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;

    fn line(task: &str, container: &str, ts: i64, level: &str, text: &str) -> TaskLog {
        TaskLog {
            id: None,
            task_arn: task.to_string(),
            container_name: container.to_string(),
            timestamp: ts,
            log_line: text.to_string(),
            log_level: level.to_string(),
            created_at: ts,
        }
    }

    #[tokio::test]
    async fn filters_compose() {
        let (_dir, db) = scratch().await;
        let store = db.task_logs();
        store
            .save_logs(vec![
                line("t-1", "app", 100, "INFO", "listening on :8080"),
                line("t-1", "app", 200, "ERROR", "connection refused"),
                line("t-1", "sidecar", 300, "INFO", "proxy ready"),
                line("t-2", "app", 400, "INFO", "listening on :8080"),
            ])
            .await
            .unwrap();

        let by_task = store
            .get_logs(TaskLogFilter {
                task_arn: Some("t-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_task.len(), 3);

        let errors = store
            .get_logs(TaskLogFilter {
                task_arn: Some("t-1".to_string()),
                log_level: Some("ERROR".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].log_line.contains("refused"));

        let search = store
            .get_logs(TaskLogFilter {
                search: Some("listening".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(search.len(), 2);

        let windowed = store
            .get_logs(TaskLogFilter {
                from: Some(150),
                to: Some(350),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(windowed.len(), 2);

        let paged = store
            .get_logs(TaskLogFilter {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 2);
        assert_eq!(paged[0].timestamp, 300);
    }

    #[tokio::test]
    async fn retention_cutoff() {
        let (_dir, db) = scratch().await;
        let store = db.task_logs();
        store
            .save_logs(vec![
                line("t-1", "app", 100, "INFO", "old"),
                line("t-1", "app", 5000, "INFO", "new"),
            ])
            .await
            .unwrap();
        let deleted = store.delete_old_logs(1000).await.unwrap();
        assert_eq!(deleted, 1);
        let rest = store.get_logs(TaskLogFilter::default()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].log_line, "new");

        assert_eq!(store.delete_task_logs("t-1").await.unwrap(), 1);
        assert!(store.get_logs(TaskLogFilter::default()).await.unwrap().is_empty());
    }
}
