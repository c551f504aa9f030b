use deadpool_sqlite::Pool;
use kecs_types::error::entities;
use kecs_types::task::{Task, status};
use kecs_types::{Error, Result, arn};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, from_blob, run, to_blob, token};

#[derive(Clone)]
pub struct TaskStore {
    pool: Pool,
}

/// Filters for [`TaskStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    /// Matches tasks started by the named service.
    pub service_name: Option<String>,
    pub desired_status: Option<String>,
    pub launch_type: Option<String>,
    pub started_by: Option<String>,
    pub max_results: Option<i64>,
    pub next_token: Option<String>,
}

const COLUMNS: &str = "id, arn, cluster_arn, task_definition_arn, container_instance_arn, \
     last_status, desired_status, containers, launch_type, started_by, stopped_reason, \
     stop_code, connectivity, pull_started_at, pull_stopped_at, started_at, stopping_at, \
     stopped_at, execution_stopped_at, pod_name, namespace, version, created_at";

fn row_to_task(row: &Row, offset: usize) -> Result<Task> {
    let containers: String = row.get(offset + 7).map_err(db_err)?;
    Ok(Task {
        id: row.get(offset).map_err(db_err)?,
        arn: row.get(offset + 1).map_err(db_err)?,
        cluster_arn: row.get(offset + 2).map_err(db_err)?,
        task_definition_arn: row.get(offset + 3).map_err(db_err)?,
        container_instance_arn: row.get(offset + 4).map_err(db_err)?,
        last_status: row.get(offset + 5).map_err(db_err)?,
        desired_status: row.get(offset + 6).map_err(db_err)?,
        containers: from_blob(&containers)?,
        launch_type: row.get(offset + 8).map_err(db_err)?,
        started_by: row.get(offset + 9).map_err(db_err)?,
        stopped_reason: row.get(offset + 10).map_err(db_err)?,
        stop_code: row.get(offset + 11).map_err(db_err)?,
        connectivity: row.get(offset + 12).map_err(db_err)?,
        pull_started_at: row.get(offset + 13).map_err(db_err)?,
        pull_stopped_at: row.get(offset + 14).map_err(db_err)?,
        started_at: row.get(offset + 15).map_err(db_err)?,
        stopping_at: row.get(offset + 16).map_err(db_err)?,
        stopped_at: row.get(offset + 17).map_err(db_err)?,
        execution_stopped_at: row.get(offset + 18).map_err(db_err)?,
        pod_name: row.get(offset + 19).map_err(db_err)?,
        namespace: row.get(offset + 20).map_err(db_err)?,
        version: row.get(offset + 21).map_err(db_err)?,
        created_at: row.get(offset + 22).map_err(db_err)?,
    })
}

impl TaskStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, task: Task) -> Result<Task> {
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "INSERT INTO tasks (id, arn, cluster_arn, task_definition_arn, \
                 container_instance_arn, last_status, desired_status, containers, launch_type, \
                 started_by, stopped_reason, stop_code, connectivity, pull_started_at, \
                 pull_stopped_at, started_at, stopping_at, stopped_at, execution_stopped_at, \
                 pod_name, namespace, version, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
            )
            .map_err(db_err)?
            .execute(params![
                task.id,
                task.arn,
                task.cluster_arn,
                task.task_definition_arn,
                task.container_instance_arn,
                task.last_status,
                task.desired_status,
                to_blob(&task.containers)?,
                task.launch_type,
                task.started_by,
                task.stopped_reason,
                task.stop_code,
                task.connectivity,
                task.pull_started_at,
                task.pull_stopped_at,
                task.started_at,
                task.stopping_at,
                task.stopped_at,
                task.execution_stopped_at,
                task.pod_name,
                task.namespace,
                task.version,
                task.created_at,
            ])
            .map_err(db_err)?;
            Ok(task)
        })
        .await
    }

    /// Look up by task id or full ARN within a cluster.
    pub async fn get(&self, cluster_arn: &str, id_or_arn: &str) -> Result<Task> {
        let cluster_arn = cluster_arn.to_string();
        let id = arn::resource_name(id_or_arn).to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM tasks WHERE cluster_arn = ?1 AND (id = ?2 OR arn = ?3)"
            ))
            .map_err(db_err)?
            .query_row(params![cluster_arn, id, id], |row| Ok(row_to_task(row, 0)))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::TASK, &id))?
        })
        .await
    }

    pub async fn get_by_arns(&self, cluster_arn: &str, arns: &[String]) -> Result<Vec<Task>> {
        let mut out = Vec::with_capacity(arns.len());
        for reference in arns {
            match self.get(cluster_arn, reference).await {
                Ok(task) => out.push(task),
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Compare-and-set update: the write is conditional on `task.version`
    /// still being current, and bumps it. A lost race surfaces `Conflict`;
    /// the caller re-reads and retries.
    pub async fn update(&self, mut task: Task) -> Result<Task> {
        let expected = task.version;
        task.version = expected + 1;
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE tasks SET last_status = ?2, desired_status = ?3, containers = ?4, \
                     stopped_reason = ?5, stop_code = ?6, connectivity = ?7, \
                     pull_started_at = ?8, pull_stopped_at = ?9, started_at = ?10, \
                     stopping_at = ?11, stopped_at = ?12, execution_stopped_at = ?13, \
                     pod_name = ?14, namespace = ?15, version = ?16 \
                     WHERE arn = ?1 AND version = ?17",
                )
                .map_err(db_err)?
                .execute(params![
                    task.arn,
                    task.last_status,
                    task.desired_status,
                    to_blob(&task.containers)?,
                    task.stopped_reason,
                    task.stop_code,
                    task.connectivity,
                    task.pull_started_at,
                    task.pull_stopped_at,
                    task.started_at,
                    task.stopping_at,
                    task.stopped_at,
                    task.execution_stopped_at,
                    task.pod_name,
                    task.namespace,
                    task.version,
                    expected,
                ])
                .map_err(db_err)?;
            if changed == 0 {
                let exists: Option<i64> = conn
                    .prepare_cached("SELECT version FROM tasks WHERE arn = ?1")
                    .map_err(db_err)?
                    .query_row(params![task.arn], |r| r.get(0))
                    .optional()
                    .map_err(db_err)?;
                return match exists {
                    Some(current) => Err(Error::Conflict(format!(
                        "task {} version {current} != expected {expected}",
                        task.arn
                    ))),
                    None => Err(Error::not_found(entities::TASK, &task.arn)),
                };
            }
            Ok(task)
        })
        .await
    }

    pub async fn delete(&self, cluster_arn: &str, id_or_arn: &str) -> Result<()> {
        let cluster_arn = cluster_arn.to_string();
        let id = arn::resource_name(id_or_arn).to_string();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached("DELETE FROM tasks WHERE cluster_arn = ?1 AND (id = ?2 OR arn = ?3)")
                .map_err(db_err)?
                .execute(params![cluster_arn, id, id])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::TASK, &id));
            }
            Ok(())
        })
        .await
    }

    pub async fn list(
        &self,
        cluster_arn: &str,
        filters: TaskFilters,
    ) -> Result<(Vec<Task>, Option<String>)> {
        let cluster_arn = cluster_arn.to_string();
        let digest = token::filter_digest([
            "tasks",
            cluster_arn.as_str(),
            filters.service_name.as_deref().unwrap_or(""),
            filters.desired_status.as_deref().unwrap_or(""),
            filters.launch_type.as_deref().unwrap_or(""),
            filters.started_by.as_deref().unwrap_or(""),
        ]);
        let after = match filters.next_token.as_deref() {
            Some(t) => token::decode(t, digest)?,
            None => 0,
        };
        let page = filters.max_results.unwrap_or(100).clamp(1, 100);
        run(&self.pool, move |conn| {
            let mut sql = format!(
                "SELECT rowid, {COLUMNS} FROM tasks WHERE cluster_arn = ?1 AND rowid > ?2"
            );
            let mut binds: Vec<String> = Vec::new();
            if let Some(service) = &filters.service_name {
                // Service-started tasks carry the scheduler prefix.
                sql.push_str(&format!(
                    " AND (started_by = ?{} OR started_by = ?{})",
                    binds.len() + 3,
                    binds.len() + 4
                ));
                binds.push(format!("ecs-svc/{service}"));
                binds.push(service.clone());
            }
            if let Some(desired) = &filters.desired_status {
                sql.push_str(&format!(" AND desired_status = ?{}", binds.len() + 3));
                binds.push(desired.clone());
            }
            if let Some(lt) = &filters.launch_type {
                sql.push_str(&format!(" AND launch_type = ?{}", binds.len() + 3));
                binds.push(lt.clone());
            }
            if let Some(starter) = &filters.started_by {
                sql.push_str(&format!(" AND started_by = ?{}", binds.len() + 3));
                binds.push(starter.clone());
            }
            sql.push_str(&format!(" ORDER BY rowid LIMIT ?{}", binds.len() + 3));

            let mut stmt = conn.prepare_cached(&sql).map_err(db_err)?;
            let mut values: Vec<Box<dyn rusqlite::ToSql>> =
                vec![Box::new(cluster_arn.clone()), Box::new(after)];
            for bind in &binds {
                values.push(Box::new(bind.clone()));
            }
            values.push(Box::new(page + 1));
            let params_ref: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|b| b.as_ref()).collect();
            let mut rows = stmt.query(params_ref.as_slice()).map_err(db_err)?;
            let mut out = Vec::new();
            let mut last_id = after;
            while let Some(row) = rows.next().map_err(db_err)? {
                if out.len() as i64 == page {
                    return Ok((out, Some(token::encode(last_id, digest))));
                }
                last_id = row.get(0).map_err(db_err)?;
                out.push(row_to_task(row, 1)?);
            }
            Ok((out, None))
        })
        .await
    }

    /// Tasks the reconciler still owes work: everything not settled plus
    /// RUNNING tasks whose desired status flipped to STOPPED.
    pub async fn list_unsettled(&self, cluster_arn: &str) -> Result<Vec<Task>> {
        let cluster_arn = cluster_arn.to_string();
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM tasks WHERE cluster_arn = ?1 AND last_status != ?2 \
                     ORDER BY rowid"
                ))
                .map_err(db_err)?;
            let mut rows = stmt
                .query(params![cluster_arn, status::STOPPED])
                .map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(row_to_task(row, 0)?);
            }
            Ok(out)
        })
        .await
    }
}
