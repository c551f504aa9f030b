use deadpool_sqlite::Pool;
use kecs_types::container_instance::{ContainerInstance, status};
use kecs_types::error::entities;
use kecs_types::{Error, Result, arn};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, opt_blob, opt_from_blob, run};

#[derive(Clone)]
pub struct ContainerInstanceStore {
    pool: Pool,
}

const COLUMNS: &str = "arn, cluster_arn, ec2_instance_id, status, agent_connected, \
     running_tasks_count, pending_tasks_count, registered_resources, remaining_resources, \
     version_info, attributes, registered_at, deregistered_at";

fn row_to_instance(row: &Row) -> Result<ContainerInstance> {
    Ok(ContainerInstance {
        arn: row.get(0).map_err(db_err)?,
        cluster_arn: row.get(1).map_err(db_err)?,
        ec2_instance_id: row.get(2).map_err(db_err)?,
        status: row.get(3).map_err(db_err)?,
        agent_connected: row.get::<_, i64>(4).map_err(db_err)? != 0,
        running_tasks_count: row.get(5).map_err(db_err)?,
        pending_tasks_count: row.get(6).map_err(db_err)?,
        registered_resources: opt_from_blob(row.get(7).map_err(db_err)?)?,
        remaining_resources: opt_from_blob(row.get(8).map_err(db_err)?)?,
        version_info: opt_from_blob(row.get(9).map_err(db_err)?)?,
        attributes: opt_from_blob(row.get(10).map_err(db_err)?)?,
        registered_at: row.get(11).map_err(db_err)?,
        deregistered_at: row.get(12).map_err(db_err)?,
    })
}

impl ContainerInstanceStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, instance: ContainerInstance) -> Result<ContainerInstance> {
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "INSERT OR REPLACE INTO container_instances (arn, cluster_arn, ec2_instance_id, \
                 status, agent_connected, running_tasks_count, pending_tasks_count, \
                 registered_resources, remaining_resources, version_info, attributes, \
                 registered_at, deregistered_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .map_err(db_err)?
            .execute(params![
                instance.arn,
                instance.cluster_arn,
                instance.ec2_instance_id,
                instance.status,
                instance.agent_connected as i64,
                instance.running_tasks_count,
                instance.pending_tasks_count,
                opt_blob(&instance.registered_resources)?,
                opt_blob(&instance.remaining_resources)?,
                opt_blob(&instance.version_info)?,
                opt_blob(&instance.attributes)?,
                instance.registered_at,
                instance.deregistered_at,
            ])
            .map_err(db_err)?;
            Ok(instance)
        })
        .await
    }

    pub async fn get(&self, cluster_arn: &str, id_or_arn: &str) -> Result<ContainerInstance> {
        let cluster_arn = cluster_arn.to_string();
        let id = arn::resource_name(id_or_arn).to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM container_instances \
                 WHERE cluster_arn = ?1 AND (arn = ?2 OR arn LIKE ?3)"
            ))
            .map_err(db_err)?
            .query_row(params![cluster_arn, id, format!("%/{id}")], |row| {
                Ok(row_to_instance(row))
            })
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::CONTAINER_INSTANCE, &id))?
        })
        .await
    }

    pub async fn list(
        &self,
        cluster_arn: &str,
        status_filter: Option<String>,
    ) -> Result<Vec<ContainerInstance>> {
        let cluster_arn = cluster_arn.to_string();
        run(&self.pool, move |conn| {
            let status = status_filter.unwrap_or_else(|| "%".to_string());
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM container_instances \
                     WHERE cluster_arn = ?1 AND status LIKE ?2 ORDER BY rowid"
                ))
                .map_err(db_err)?;
            let mut rows = stmt.query(params![cluster_arn, status]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(row_to_instance(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn deregister(&self, cluster_arn: &str, id_or_arn: &str) -> Result<ContainerInstance> {
        let mut instance = self.get(cluster_arn, id_or_arn).await?;
        instance.status = status::INACTIVE.to_string();
        instance.agent_connected = false;
        instance.deregistered_at = Some(kecs_common::now_ms());
        self.register(instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use kecs_types::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION};

    const CLUSTER: &str = "arn:aws:ecs:us-east-1:000000000000:cluster/default";

    fn sample(id: &str) -> ContainerInstance {
        ContainerInstance {
            arn: arn::container_instance(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, "default", id),
            cluster_arn: CLUSTER.to_string(),
            ec2_instance_id: format!("i-{id}"),
            status: status::ACTIVE.to_string(),
            agent_connected: true,
            running_tasks_count: 0,
            pending_tasks_count: 0,
            registered_resources: Some(serde_json::json!([{"name": "CPU", "integerValue": 2048}])),
            remaining_resources: None,
            version_info: None,
            attributes: None,
            registered_at: 1,
            deregistered_at: None,
        }
    }

    #[tokio::test]
    async fn register_get_deregister() {
        let (_dir, db) = scratch().await;
        let store = db.container_instances();
        store.register(sample("abc123")).await.unwrap();

        let got = store.get(CLUSTER, "abc123").await.unwrap();
        assert!(got.agent_connected);
        assert_eq!(got.registered_resources.unwrap()[0]["name"], "CPU");

        let gone = store.deregister(CLUSTER, "abc123").await.unwrap();
        assert_eq!(gone.status, status::INACTIVE);
        assert!(!gone.agent_connected);
        assert!(gone.deregistered_at.is_some());

        let active = store
            .list(CLUSTER, Some(status::ACTIVE.to_string()))
            .await
            .unwrap();
        assert!(active.is_empty());
    }
}
