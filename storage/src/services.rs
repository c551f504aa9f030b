use deadpool_sqlite::Pool;
use kecs_types::error::entities;
use kecs_types::service::{Service, status};
use kecs_types::{Error, Result, arn};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, from_blob, opt_blob, opt_from_blob, run, to_blob, token};

#[derive(Clone)]
pub struct ServiceStore {
    pool: Pool,
}

const COLUMNS: &str = "id, arn, service_name, cluster_arn, task_definition_arn, desired_count, \
     running_count, pending_count, launch_type, status, load_balancers, service_registries, \
     network_configuration, deployment_configuration, scheduling_strategy, role_arn, \
     platform_version, primary_task_set, created_at, updated_at";

fn row_to_service(row: &Row, offset: usize) -> Result<Service> {
    let lbs: String = row.get(offset + 10).map_err(db_err)?;
    let registries: String = row.get(offset + 11).map_err(db_err)?;
    Ok(Service {
        id: row.get(offset).map_err(db_err)?,
        arn: row.get(offset + 1).map_err(db_err)?,
        service_name: row.get(offset + 2).map_err(db_err)?,
        cluster_arn: row.get(offset + 3).map_err(db_err)?,
        task_definition_arn: row.get(offset + 4).map_err(db_err)?,
        desired_count: row.get(offset + 5).map_err(db_err)?,
        running_count: row.get(offset + 6).map_err(db_err)?,
        pending_count: row.get(offset + 7).map_err(db_err)?,
        launch_type: row.get(offset + 8).map_err(db_err)?,
        status: row.get(offset + 9).map_err(db_err)?,
        load_balancers: from_blob(&lbs)?,
        service_registries: from_blob(&registries)?,
        network_configuration: opt_from_blob(row.get(offset + 12).map_err(db_err)?)?,
        deployment_configuration: opt_from_blob(row.get(offset + 13).map_err(db_err)?)?,
        scheduling_strategy: row.get(offset + 14).map_err(db_err)?,
        role_arn: row.get(offset + 15).map_err(db_err)?,
        platform_version: row.get(offset + 16).map_err(db_err)?,
        primary_task_set: row.get(offset + 17).map_err(db_err)?,
        created_at: row.get(offset + 18).map_err(db_err)?,
        updated_at: row.get(offset + 19).map_err(db_err)?,
    })
}

impl ServiceStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, service: Service) -> Result<Service> {
        run(&self.pool, move |conn| {
            let existing: Option<String> = conn
                .prepare_cached(
                    "SELECT status FROM services WHERE cluster_arn = ?1 AND service_name = ?2",
                )
                .map_err(db_err)?
                .query_row(params![service.cluster_arn, service.service_name], |r| {
                    r.get(0)
                })
                .optional()
                .map_err(db_err)?;
            match existing.as_deref() {
                Some(s) if s != status::INACTIVE => {
                    return Err(Error::already_exists(
                        entities::SERVICE,
                        &service.service_name,
                    ));
                }
                Some(_) => {
                    // An INACTIVE leftover may be replaced.
                    conn.prepare_cached(
                        "DELETE FROM services WHERE cluster_arn = ?1 AND service_name = ?2",
                    )
                    .map_err(db_err)?
                    .execute(params![service.cluster_arn, service.service_name])
                    .map_err(db_err)?;
                }
                None => {}
            }
            conn.prepare_cached(
                "INSERT INTO services (id, arn, service_name, cluster_arn, task_definition_arn, \
                 desired_count, running_count, pending_count, launch_type, status, \
                 load_balancers, service_registries, network_configuration, \
                 deployment_configuration, scheduling_strategy, role_arn, platform_version, \
                 primary_task_set, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20)",
            )
            .map_err(db_err)?
            .execute(params![
                service.id,
                service.arn,
                service.service_name,
                service.cluster_arn,
                service.task_definition_arn,
                service.desired_count,
                service.running_count,
                service.pending_count,
                service.launch_type,
                service.status,
                to_blob(&service.load_balancers)?,
                to_blob(&service.service_registries)?,
                opt_blob(&service.network_configuration)?,
                opt_blob(&service.deployment_configuration)?,
                service.scheduling_strategy,
                service.role_arn,
                service.platform_version,
                service.primary_task_set,
                service.created_at,
                service.updated_at,
            ])
            .map_err(db_err)?;
            Ok(service)
        })
        .await
    }

    pub async fn get(&self, cluster_arn: &str, name_or_arn: &str) -> Result<Service> {
        let cluster_arn = cluster_arn.to_string();
        let name = arn::resource_name(name_or_arn).to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM services WHERE cluster_arn = ?1 AND service_name = ?2"
            ))
            .map_err(db_err)?
            .query_row(params![cluster_arn, name], |row| Ok(row_to_service(row, 0)))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::SERVICE, &name))?
        })
        .await
    }

    pub async fn update(&self, mut service: Service) -> Result<Service> {
        service.updated_at = kecs_common::now_ms();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE services SET task_definition_arn = ?2, desired_count = ?3, \
                     running_count = ?4, pending_count = ?5, status = ?6, load_balancers = ?7, \
                     service_registries = ?8, network_configuration = ?9, \
                     deployment_configuration = ?10, primary_task_set = ?11, updated_at = ?12 \
                     WHERE arn = ?1",
                )
                .map_err(db_err)?
                .execute(params![
                    service.arn,
                    service.task_definition_arn,
                    service.desired_count,
                    service.running_count,
                    service.pending_count,
                    service.status,
                    to_blob(&service.load_balancers)?,
                    to_blob(&service.service_registries)?,
                    opt_blob(&service.network_configuration)?,
                    opt_blob(&service.deployment_configuration)?,
                    service.primary_task_set,
                    service.updated_at,
                ])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::SERVICE, &service.service_name));
            }
            Ok(service)
        })
        .await
    }

    /// Service deletion marks INACTIVE; the row survives for Describe.
    pub async fn delete(&self, cluster_arn: &str, name_or_arn: &str) -> Result<Service> {
        let mut service = self.get(cluster_arn, name_or_arn).await?;
        service.status = status::INACTIVE.to_string();
        service.desired_count = 0;
        self.update(service).await
    }

    pub async fn list(
        &self,
        cluster_arn: &str,
        launch_type: Option<String>,
        limit: Option<i64>,
        next_token: Option<String>,
    ) -> Result<(Vec<Service>, Option<String>)> {
        let cluster_arn = cluster_arn.to_string();
        let digest = token::filter_digest([
            "services",
            cluster_arn.as_str(),
            launch_type.as_deref().unwrap_or(""),
        ]);
        let after = match next_token.as_deref() {
            Some(t) => token::decode(t, digest)?,
            None => 0,
        };
        let page = limit.unwrap_or(10).clamp(1, 100);
        run(&self.pool, move |conn| {
            let lt = launch_type.unwrap_or_else(|| "%".to_string());
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT rowid, {COLUMNS} FROM services \
                     WHERE cluster_arn = ?1 AND launch_type LIKE ?2 AND status != 'INACTIVE' \
                     AND rowid > ?3 ORDER BY rowid LIMIT ?4"
                ))
                .map_err(db_err)?;
            let mut rows = stmt
                .query(params![cluster_arn, lt, after, page + 1])
                .map_err(db_err)?;
            let mut out = Vec::new();
            let mut last_id = after;
            while let Some(row) = rows.next().map_err(db_err)? {
                if out.len() as i64 == page {
                    return Ok((out, Some(token::encode(last_id, digest))));
                }
                last_id = row.get(0).map_err(db_err)?;
                out.push(row_to_service(row, 1)?);
            }
            Ok((out, None))
        })
        .await
    }
}
