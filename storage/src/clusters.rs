use deadpool_sqlite::Pool;
use kecs_types::cluster::Cluster;
use kecs_types::error::entities;
use kecs_types::task::status as task_status;
use kecs_types::{Error, Result};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, opt_blob, opt_from_blob, run, token};

#[derive(Clone)]
pub struct ClusterStore {
    pool: Pool,
}

const COLUMNS: &str = "id, arn, name, status, region, account_id, k8s_cluster_name, \
     registered_container_instances_count, running_tasks_count, pending_tasks_count, \
     active_services_count, localstack_state, settings, tags, created_at, updated_at";

fn row_to_cluster(row: &Row) -> Result<Cluster> {
    Ok(Cluster {
        id: row.get(0).map_err(db_err)?,
        arn: row.get(1).map_err(db_err)?,
        name: row.get(2).map_err(db_err)?,
        status: row.get(3).map_err(db_err)?,
        region: row.get(4).map_err(db_err)?,
        account_id: row.get(5).map_err(db_err)?,
        k8s_cluster_name: row.get(6).map_err(db_err)?,
        registered_container_instances_count: row.get(7).map_err(db_err)?,
        running_tasks_count: row.get(8).map_err(db_err)?,
        pending_tasks_count: row.get(9).map_err(db_err)?,
        active_services_count: row.get(10).map_err(db_err)?,
        localstack_state: opt_from_blob(row.get(11).map_err(db_err)?)?,
        settings: opt_from_blob(row.get(12).map_err(db_err)?)?,
        tags: opt_from_blob(row.get(13).map_err(db_err)?)?,
        created_at: row.get(14).map_err(db_err)?,
        updated_at: row.get(15).map_err(db_err)?,
    })
}

impl ClusterStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, cluster: Cluster) -> Result<Cluster> {
        run(&self.pool, move |conn| {
            let exists: Option<String> = conn
                .prepare_cached("SELECT name FROM clusters WHERE name = ?1")
                .map_err(db_err)?
                .query_row(params![cluster.name], |r| r.get(0))
                .optional()
                .map_err(db_err)?;
            if exists.is_some() {
                return Err(Error::already_exists(entities::CLUSTER, &cluster.name));
            }
            conn.prepare_cached(
                "INSERT INTO clusters (id, arn, name, status, region, account_id, \
                 k8s_cluster_name, registered_container_instances_count, running_tasks_count, \
                 pending_tasks_count, active_services_count, localstack_state, settings, tags, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )
            .map_err(db_err)?
            .execute(params![
                cluster.id,
                cluster.arn,
                cluster.name,
                cluster.status,
                cluster.region,
                cluster.account_id,
                cluster.k8s_cluster_name,
                cluster.registered_container_instances_count,
                cluster.running_tasks_count,
                cluster.pending_tasks_count,
                cluster.active_services_count,
                opt_blob(&cluster.localstack_state)?,
                opt_blob(&cluster.settings)?,
                opt_blob(&cluster.tags)?,
                cluster.created_at,
                cluster.updated_at,
            ])
            .map_err(db_err)?;
            Ok(cluster)
        })
        .await
    }

    /// Look up by bare name or full ARN.
    pub async fn get(&self, name_or_arn: &str) -> Result<Cluster> {
        let name = kecs_types::arn::resource_name(name_or_arn).to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!("SELECT {COLUMNS} FROM clusters WHERE name = ?1"))
                .map_err(db_err)?
                .query_row(params![name], |row| Ok(row_to_cluster(row)))
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| Error::not_found(entities::CLUSTER, &name))?
        })
        .await
    }

    pub async fn list(
        &self,
        limit: Option<i64>,
        next_token: Option<String>,
    ) -> Result<(Vec<Cluster>, Option<String>)> {
        let digest = token::filter_digest(["clusters"]);
        let after = match next_token.as_deref() {
            Some(t) => token::decode(t, digest)?,
            None => 0,
        };
        let page = limit.unwrap_or(100).clamp(1, 100);
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT rowid, {COLUMNS} FROM clusters WHERE rowid > ?1 \
                     ORDER BY rowid LIMIT ?2"
                ))
                .map_err(db_err)?;
            let mut rows = stmt.query(params![after, page + 1]).map_err(db_err)?;
            let mut out = Vec::new();
            let mut last_id = after;
            while let Some(row) = rows.next().map_err(db_err)? {
                if out.len() as i64 == page {
                    return Ok((out, Some(token::encode(last_id, digest))));
                }
                last_id = row.get(0).map_err(db_err)?;
                // Shift column indices past the leading rowid.
                let cluster = Cluster {
                    id: row.get(1).map_err(db_err)?,
                    arn: row.get(2).map_err(db_err)?,
                    name: row.get(3).map_err(db_err)?,
                    status: row.get(4).map_err(db_err)?,
                    region: row.get(5).map_err(db_err)?,
                    account_id: row.get(6).map_err(db_err)?,
                    k8s_cluster_name: row.get(7).map_err(db_err)?,
                    registered_container_instances_count: row.get(8).map_err(db_err)?,
                    running_tasks_count: row.get(9).map_err(db_err)?,
                    pending_tasks_count: row.get(10).map_err(db_err)?,
                    active_services_count: row.get(11).map_err(db_err)?,
                    localstack_state: opt_from_blob(row.get(12).map_err(db_err)?)?,
                    settings: opt_from_blob(row.get(13).map_err(db_err)?)?,
                    tags: opt_from_blob(row.get(14).map_err(db_err)?)?,
                    created_at: row.get(15).map_err(db_err)?,
                    updated_at: row.get(16).map_err(db_err)?,
                };
                out.push(cluster);
            }
            Ok((out, None))
        })
        .await
    }

    pub async fn update(&self, cluster: Cluster) -> Result<Cluster> {
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE clusters SET status = ?2, \
                     registered_container_instances_count = ?3, running_tasks_count = ?4, \
                     pending_tasks_count = ?5, active_services_count = ?6, \
                     localstack_state = ?7, settings = ?8, tags = ?9, updated_at = ?10 \
                     WHERE name = ?1",
                )
                .map_err(db_err)?
                .execute(params![
                    cluster.name,
                    cluster.status,
                    cluster.registered_container_instances_count,
                    cluster.running_tasks_count,
                    cluster.pending_tasks_count,
                    cluster.active_services_count,
                    opt_blob(&cluster.localstack_state)?,
                    opt_blob(&cluster.settings)?,
                    opt_blob(&cluster.tags)?,
                    cluster.updated_at,
                ])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::CLUSTER, &cluster.name));
            }
            Ok(cluster)
        })
        .await
    }

    /// Re-derive the denormalized counters from the child tables. The
    /// counters are eventually consistent; this is the convergence step.
    pub async fn refresh_counts(&self, cluster_arn: &str) -> Result<()> {
        let cluster_arn = cluster_arn.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "UPDATE clusters SET \
                 running_tasks_count = (SELECT COUNT(*) FROM tasks \
                     WHERE cluster_arn = ?1 AND last_status = 'RUNNING'), \
                 pending_tasks_count = (SELECT COUNT(*) FROM tasks \
                     WHERE cluster_arn = ?1 AND last_status IN ('PROVISIONING', 'PENDING')), \
                 active_services_count = (SELECT COUNT(*) FROM services \
                     WHERE cluster_arn = ?1 AND status = 'ACTIVE'), \
                 registered_container_instances_count = (SELECT COUNT(*) FROM \
                     container_instances WHERE cluster_arn = ?1 AND status = 'ACTIVE') \
                 WHERE arn = ?1",
            )
            .map_err(db_err)?
            .execute(params![cluster_arn])
            .map_err(db_err)?;
            Ok(())
        })
        .await
    }

    /// Delete a cluster. Refuses while ACTIVE services or live tasks still
    /// reference it; the existence checks and the delete share one
    /// transaction.
    pub async fn delete(&self, name_or_arn: &str) -> Result<Cluster> {
        let name = kecs_types::arn::resource_name(name_or_arn).to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let cluster = tx
                .prepare_cached(&format!("SELECT {COLUMNS} FROM clusters WHERE name = ?1"))
                .map_err(db_err)?
                .query_row(params![name], |row| Ok(row_to_cluster(row)))
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| Error::not_found(entities::CLUSTER, &name))??;

            let active_services: i64 = tx
                .prepare_cached(
                    "SELECT COUNT(*) FROM services WHERE cluster_arn = ?1 AND status = 'ACTIVE'",
                )
                .map_err(db_err)?
                .query_row(params![cluster.arn], |r| r.get(0))
                .map_err(db_err)?;
            if active_services > 0 {
                return Err(Error::ClusterContainsServices);
            }

            let live_tasks: i64 = tx
                .prepare_cached(
                    "SELECT COUNT(*) FROM tasks WHERE cluster_arn = ?1 AND last_status != ?2",
                )
                .map_err(db_err)?
                .query_row(params![cluster.arn, task_status::STOPPED], |r| r.get(0))
                .map_err(db_err)?;
            if live_tasks > 0 {
                return Err(Error::ClusterContainsTasks);
            }

            tx.prepare_cached("DELETE FROM clusters WHERE name = ?1")
                .map_err(db_err)?
                .execute(params![name])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(cluster)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use kecs_types::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION, arn, cluster::status};

    pub(crate) fn sample(name: &str) -> Cluster {
        Cluster {
            id: uuid::Uuid::new_v4().to_string(),
            arn: arn::cluster(DEFAULT_REGION, DEFAULT_ACCOUNT_ID, name),
            name: name.to_string(),
            status: status::ACTIVE.to_string(),
            region: DEFAULT_REGION.to_string(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            k8s_cluster_name: format!("kecs-{name}"),
            registered_container_instances_count: 0,
            running_tasks_count: 0,
            pending_tasks_count: 0,
            active_services_count: 0,
            localstack_state: None,
            settings: None,
            tags: Some(serde_json::json!([{"key": "env", "value": "dev"}])),
            created_at: 1,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (_dir, db) = scratch().await;
        let store = db.clusters();
        store.create(sample("default")).await.unwrap();
        let got = store.get("default").await.unwrap();
        assert_eq!(got.status, status::ACTIVE);
        assert!(got.arn.ends_with("/default"));
        // JSON blob fields re-parse to the same value.
        assert_eq!(got.tags.unwrap()[0]["key"], "env");
        // ARN lookup works too.
        let by_arn = store
            .get("arn:aws:ecs:us-east-1:000000000000:cluster/default")
            .await
            .unwrap();
        assert_eq!(by_arn.name, "default");
    }

    #[tokio::test]
    async fn duplicate_name_rejected() {
        let (_dir, db) = scratch().await;
        let store = db.clusters();
        store.create(sample("default")).await.unwrap();
        let err = store.create(sample("default")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn list_pages_disjoint() {
        let (_dir, db) = scratch().await;
        let store = db.clusters();
        for i in 0..5 {
            store.create(sample(&format!("c{i}"))).await.unwrap();
        }
        let (first, tok) = store.list(Some(2), None).await.unwrap();
        assert_eq!(first.len(), 2);
        let tok = tok.expect("more pages");
        let (second, tok2) = store.list(Some(2), Some(tok)).await.unwrap();
        assert_eq!(second.len(), 2);
        let names: Vec<_> = first.iter().chain(&second).map(|c| &c.name).collect();
        let mut unique = names.clone();
        unique.dedup();
        assert_eq!(names.len(), unique.len());
        let (rest, end) = store.list(Some(2), tok2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let (_dir, db) = scratch().await;
        let err = db.clusters().delete("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
