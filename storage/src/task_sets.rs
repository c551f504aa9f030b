use deadpool_sqlite::Pool;
use kecs_types::error::entities;
use kecs_types::task_set::TaskSet;
use kecs_types::{Error, Result};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, from_blob, opt_blob, opt_from_blob, run, to_blob};

#[derive(Clone)]
pub struct TaskSetStore {
    pool: Pool,
}

const COLUMNS: &str = "id, arn, service_arn, cluster_arn, external_id, task_definition, scale, \
     computed_desired_count, running_count, pending_count, status, stability_status, \
     network_configuration, load_balancers, service_registries, launch_type, created_at, \
     updated_at";

fn row_to_task_set(row: &Row) -> Result<TaskSet> {
    let lbs: String = row.get(13).map_err(db_err)?;
    let registries: String = row.get(14).map_err(db_err)?;
    Ok(TaskSet {
        id: row.get(0).map_err(db_err)?,
        arn: row.get(1).map_err(db_err)?,
        service_arn: row.get(2).map_err(db_err)?,
        cluster_arn: row.get(3).map_err(db_err)?,
        external_id: row.get(4).map_err(db_err)?,
        task_definition: row.get(5).map_err(db_err)?,
        scale: opt_from_blob(row.get(6).map_err(db_err)?)?,
        computed_desired_count: row.get(7).map_err(db_err)?,
        running_count: row.get(8).map_err(db_err)?,
        pending_count: row.get(9).map_err(db_err)?,
        status: row.get(10).map_err(db_err)?,
        stability_status: row.get(11).map_err(db_err)?,
        network_configuration: opt_from_blob(row.get(12).map_err(db_err)?)?,
        load_balancers: from_blob(&lbs)?,
        service_registries: from_blob(&registries)?,
        launch_type: row.get(15).map_err(db_err)?,
        created_at: row.get(16).map_err(db_err)?,
        updated_at: row.get(17).map_err(db_err)?,
    })
}

impl TaskSetStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, task_set: TaskSet) -> Result<TaskSet> {
        run(&self.pool, move |conn| {
            let exists: Option<String> = conn
                .prepare_cached("SELECT id FROM task_sets WHERE service_arn = ?1 AND id = ?2")
                .map_err(db_err)?
                .query_row(params![task_set.service_arn, task_set.id], |r| r.get(0))
                .optional()
                .map_err(db_err)?;
            if exists.is_some() {
                return Err(Error::already_exists(entities::TASK_SET, &task_set.id));
            }
            conn.prepare_cached(
                "INSERT INTO task_sets (id, arn, service_arn, cluster_arn, external_id, \
                 task_definition, scale, computed_desired_count, running_count, pending_count, \
                 status, stability_status, network_configuration, load_balancers, \
                 service_registries, launch_type, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18)",
            )
            .map_err(db_err)?
            .execute(params![
                task_set.id,
                task_set.arn,
                task_set.service_arn,
                task_set.cluster_arn,
                task_set.external_id,
                task_set.task_definition,
                opt_blob(&task_set.scale)?,
                task_set.computed_desired_count,
                task_set.running_count,
                task_set.pending_count,
                task_set.status,
                task_set.stability_status,
                opt_blob(&task_set.network_configuration)?,
                to_blob(&task_set.load_balancers)?,
                to_blob(&task_set.service_registries)?,
                task_set.launch_type,
                task_set.created_at,
                task_set.updated_at,
            ])
            .map_err(db_err)?;
            Ok(task_set)
        })
        .await
    }

    pub async fn get(&self, service_arn: &str, id: &str) -> Result<TaskSet> {
        let service_arn = service_arn.to_string();
        let id = kecs_types::arn::resource_name(id).to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM task_sets WHERE service_arn = ?1 AND (id = ?2 OR arn = ?3)"
            ))
            .map_err(db_err)?
            .query_row(params![service_arn, id, id], |row| Ok(row_to_task_set(row)))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::TASK_SET, &id))?
        })
        .await
    }

    pub async fn get_by_arn(&self, ts_arn: &str) -> Result<TaskSet> {
        let ts_arn = ts_arn.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!("SELECT {COLUMNS} FROM task_sets WHERE arn = ?1"))
                .map_err(db_err)?
                .query_row(params![ts_arn], |row| Ok(row_to_task_set(row)))
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| Error::not_found(entities::TASK_SET, &ts_arn))?
        })
        .await
    }

    /// All task sets of a service, optionally narrowed to specific ids.
    pub async fn list(&self, service_arn: &str, ids: Option<Vec<String>>) -> Result<Vec<TaskSet>> {
        let service_arn = service_arn.to_string();
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM task_sets WHERE service_arn = ?1 ORDER BY rowid"
                ))
                .map_err(db_err)?;
            let mut rows = stmt.query(params![service_arn]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                let ts = row_to_task_set(row)?;
                if let Some(wanted) = &ids {
                    let matches = wanted
                        .iter()
                        .any(|w| kecs_types::arn::resource_name(w) == ts.id || *w == ts.arn);
                    if !matches {
                        continue;
                    }
                }
                out.push(ts);
            }
            Ok(out)
        })
        .await
    }

    pub async fn update(&self, mut task_set: TaskSet) -> Result<TaskSet> {
        task_set.updated_at = kecs_common::now_ms();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE task_sets SET scale = ?2, computed_desired_count = ?3, \
                     running_count = ?4, pending_count = ?5, status = ?6, \
                     stability_status = ?7, updated_at = ?8 WHERE arn = ?1",
                )
                .map_err(db_err)?
                .execute(params![
                    task_set.arn,
                    opt_blob(&task_set.scale)?,
                    task_set.computed_desired_count,
                    task_set.running_count,
                    task_set.pending_count,
                    task_set.status,
                    task_set.stability_status,
                    task_set.updated_at,
                ])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::TASK_SET, &task_set.id));
            }
            Ok(task_set)
        })
        .await
    }

    /// Remove a task set. Deliberately does NOT touch the owning service's
    /// primary pointer; a primary deleted here leaves the service pointing
    /// at a task set that no longer exists, matching observed behavior.
    pub async fn delete(&self, service_arn: &str, id: &str) -> Result<TaskSet> {
        let existing = self.get(service_arn, id).await?;
        let arn = existing.arn.clone();
        run(&self.pool, move |conn| {
            conn.prepare_cached("DELETE FROM task_sets WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            Ok(existing)
        })
        .await
    }

    /// Flip `id` to the service's primary task set: the service row's
    /// pointer moves and the task set's status becomes PRIMARY; the
    /// previous primary (if any) drops back to ACTIVE. One transaction.
    pub async fn update_primary(&self, service_arn: &str, id: &str) -> Result<TaskSet> {
        let service_arn = service_arn.to_string();
        let id = kecs_types::arn::resource_name(id).to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let target = tx
                .prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM task_sets WHERE service_arn = ?1 AND (id = ?2 OR arn = ?3)"
                ))
                .map_err(db_err)?
                .query_row(params![service_arn, id, id], |row| Ok(row_to_task_set(row)))
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| Error::not_found(entities::TASK_SET, &id))??;

            tx.prepare_cached(
                "UPDATE task_sets SET status = 'ACTIVE' WHERE service_arn = ?1 AND status = 'PRIMARY'",
            )
            .map_err(db_err)?
            .execute(params![service_arn])
            .map_err(db_err)?;
            tx.prepare_cached("UPDATE task_sets SET status = 'PRIMARY' WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![target.arn])
                .map_err(db_err)?;
            let changed = tx
                .prepare_cached("UPDATE services SET primary_task_set = ?2 WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![service_arn, target.arn])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::SERVICE, &service_arn));
            }
            tx.commit().map_err(db_err)?;
            let mut target = target;
            target.status = kecs_types::task_set::status::PRIMARY.to_string();
            Ok(target)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use kecs_types::task_set::{stability_status, status};
    use kecs_types::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION, arn};

    const CLUSTER: &str = "arn:aws:ecs:us-east-1:000000000000:cluster/default";

    fn sample(service_arn: &str, id: &str) -> TaskSet {
        TaskSet {
            id: id.to_string(),
            arn: arn::task_set(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default", "web", id),
            service_arn: service_arn.to_string(),
            cluster_arn: CLUSTER.to_string(),
            external_id: None,
            task_definition: arn::task_definition(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "web", 1),
            scale: Some(kecs_types::task_set::Scale {
                value: Some(100.0),
                unit: Some("PERCENT".to_string()),
            }),
            computed_desired_count: 2,
            running_count: 0,
            pending_count: 0,
            status: status::ACTIVE.to_string(),
            stability_status: stability_status::STABILIZING.to_string(),
            network_configuration: None,
            load_balancers: Vec::new(),
            service_registries: Vec::new(),
            launch_type: "FARGATE".to_string(),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn unique_id_per_service() {
        let (_dir, db) = scratch().await;
        let store = db.task_sets();
        let svc = "arn:aws:ecs:us-east-1:000000000000:service/default/web";
        store.create(sample(svc, "ts-1")).await.unwrap();
        let err = store.create(sample(svc, "ts-1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn update_primary_moves_pointer() {
        let (_dir, db) = scratch().await;
        let services = db.services();
        let store = db.task_sets();
        let svc = services
            .create(crate::services::tests::sample(CLUSTER, "web"))
            .await
            .unwrap();
        store.create(sample(&svc.arn, "ts-blue")).await.unwrap();
        store.create(sample(&svc.arn, "ts-green")).await.unwrap();

        let primary = store.update_primary(&svc.arn, "ts-blue").await.unwrap();
        assert_eq!(primary.status, status::PRIMARY);
        let got = services.get(CLUSTER, "web").await.unwrap();
        assert_eq!(got.primary_task_set.as_deref(), Some(primary.arn.as_str()));

        let switched = store.update_primary(&svc.arn, "ts-green").await.unwrap();
        assert_eq!(switched.status, status::PRIMARY);
        let blue = store.get(&svc.arn, "ts-blue").await.unwrap();
        assert_eq!(blue.status, status::ACTIVE);
    }

    #[tokio::test]
    async fn delete_leaves_primary_pointer_dangling() {
        let (_dir, db) = scratch().await;
        let services = db.services();
        let store = db.task_sets();
        let svc = services
            .create(crate::services::tests::sample(CLUSTER, "web"))
            .await
            .unwrap();
        store.create(sample(&svc.arn, "ts-blue")).await.unwrap();
        let primary = store.update_primary(&svc.arn, "ts-blue").await.unwrap();

        store.delete(&svc.arn, "ts-blue").await.unwrap();
        // The service still references the deleted task set.
        let got = services.get(CLUSTER, "web").await.unwrap();
        assert_eq!(got.primary_task_set.as_deref(), Some(primary.arn.as_str()));
        assert!(store.get(&svc.arn, "ts-blue").await.is_err());
    }

    #[tokio::test]
    async fn list_narrows_to_ids() {
        let (_dir, db) = scratch().await;
        let store = db.task_sets();
        let svc = "arn:aws:ecs:us-east-1:000000000000:service/default/web";
        store.create(sample(svc, "ts-1")).await.unwrap();
        store.create(sample(svc, "ts-2")).await.unwrap();
        let all = store.list(svc, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let one = store
            .list(svc, Some(vec!["ts-2".to_string()]))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id, "ts-2");
    }
}
