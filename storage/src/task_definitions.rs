use deadpool_sqlite::Pool;
use kecs_types::error::entities;
use kecs_types::task_definition::{TaskDefinition, status};
use kecs_types::{Error, Result, arn};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, from_blob, run, to_blob, token};

#[derive(Clone)]
pub struct TaskDefinitionStore {
    pool: Pool,
}

const COLUMNS: &str = "id, arn, family, revision, network_mode, container_definitions, volumes, \
     cpu, memory, task_role_arn, execution_role_arn, requires_compatibilities, status, \
     registered_at, deregistered_at";

fn row_to_task_definition(row: &Row, offset: usize) -> Result<TaskDefinition> {
    let containers: String = row.get(offset + 5).map_err(db_err)?;
    let volumes: String = row.get(offset + 6).map_err(db_err)?;
    let compat: String = row.get(offset + 11).map_err(db_err)?;
    Ok(TaskDefinition {
        id: row.get(offset).map_err(db_err)?,
        arn: row.get(offset + 1).map_err(db_err)?,
        family: row.get(offset + 2).map_err(db_err)?,
        revision: row.get(offset + 3).map_err(db_err)?,
        network_mode: row.get(offset + 4).map_err(db_err)?,
        container_definitions: from_blob(&containers)?,
        volumes: from_blob(&volumes)?,
        cpu: row.get(offset + 7).map_err(db_err)?,
        memory: row.get(offset + 8).map_err(db_err)?,
        task_role_arn: row.get(offset + 9).map_err(db_err)?,
        execution_role_arn: row.get(offset + 10).map_err(db_err)?,
        requires_compatibilities: from_blob(&compat)?,
        status: row.get(offset + 12).map_err(db_err)?,
        registered_at: row.get(offset + 13).map_err(db_err)?,
        deregistered_at: row.get(offset + 14).map_err(db_err)?,
    })
}

impl TaskDefinitionStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Register a new revision of `input.family`. The revision and ARN on
    /// `input` are ignored; the next revision in the family's dense
    /// sequence is assigned inside one transaction and the stored copy
    /// returned.
    pub async fn register(
        &self,
        mut input: TaskDefinition,
        region: &str,
        account: &str,
    ) -> Result<TaskDefinition> {
        let region = region.to_string();
        let account = account.to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let next: i64 = tx
                .prepare_cached(
                    "SELECT COALESCE(MAX(revision), 0) + 1 FROM task_definitions \
                     WHERE family = ?1",
                )
                .map_err(db_err)?
                .query_row(params![input.family], |r| r.get(0))
                .map_err(db_err)?;
            input.revision = next;
            input.arn = arn::task_definition(&region, &account, &input.family, next);
            input.status = status::ACTIVE.to_string();
            tx.prepare_cached(
                "INSERT INTO task_definitions (id, arn, family, revision, network_mode, \
                 container_definitions, volumes, cpu, memory, task_role_arn, \
                 execution_role_arn, requires_compatibilities, status, registered_at, \
                 deregistered_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            )
            .map_err(db_err)?
            .execute(params![
                input.id,
                input.arn,
                input.family,
                input.revision,
                input.network_mode,
                to_blob(&input.container_definitions)?,
                to_blob(&input.volumes)?,
                input.cpu,
                input.memory,
                input.task_role_arn,
                input.execution_role_arn,
                to_blob(&input.requires_compatibilities)?,
                input.status,
                input.registered_at,
                input.deregistered_at,
            ])
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(input)
        })
        .await
    }

    pub async fn get(&self, family: &str, revision: i64) -> Result<TaskDefinition> {
        let family = family.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM task_definitions WHERE family = ?1 AND revision = ?2"
            ))
            .map_err(db_err)?
            .query_row(params![family, revision], |row| {
                Ok(row_to_task_definition(row, 0))
            })
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| {
                Error::not_found(entities::TASK_DEFINITION, format!("{family}:{revision}"))
            })?
        })
        .await
    }

    /// Latest ACTIVE revision of a family.
    pub async fn get_latest(&self, family: &str) -> Result<TaskDefinition> {
        let family = family.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM task_definitions WHERE family = ?1 AND status = ?2 \
                 ORDER BY revision DESC LIMIT 1"
            ))
            .map_err(db_err)?
            .query_row(params![family, status::ACTIVE], |row| {
                Ok(row_to_task_definition(row, 0))
            })
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::TASK_DEFINITION, &family))?
        })
        .await
    }

    pub async fn get_by_arn(&self, td_arn: &str) -> Result<TaskDefinition> {
        let td_arn = td_arn.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM task_definitions WHERE arn = ?1"
            ))
            .map_err(db_err)?
            .query_row(params![td_arn], |row| Ok(row_to_task_definition(row, 0)))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::TASK_DEFINITION, &td_arn))?
        })
        .await
    }

    /// Resolve a `family`, `family:revision` or ARN reference the way the
    /// wire accepts it.
    pub async fn resolve(&self, reference: &str) -> Result<TaskDefinition> {
        let (family, revision) = arn::split_family_revision(reference)?;
        match revision {
            Some(rev) => self.get(&family, rev).await,
            None => self.get_latest(&family).await,
        }
    }

    /// Distinct family names, optionally prefix-filtered. Families whose
    /// every revision is INACTIVE only appear under an INACTIVE status
    /// filter.
    pub async fn list_families(
        &self,
        prefix: Option<String>,
        status_filter: Option<String>,
        limit: Option<i64>,
        next_token: Option<String>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let digest = token::filter_digest([
            "families",
            prefix.as_deref().unwrap_or(""),
            status_filter.as_deref().unwrap_or(""),
        ]);
        let after = match next_token.as_deref() {
            Some(t) => token::decode(t, digest)?,
            None => 0,
        };
        let page = limit.unwrap_or(100).clamp(1, 100);
        run(&self.pool, move |conn| {
            let status = status_filter.unwrap_or_else(|| status::ACTIVE.to_string());
            let like = format!("{}%", prefix.unwrap_or_default());
            let mut stmt = conn
                .prepare_cached(
                    "SELECT MIN(rowid) AS first_row, family FROM task_definitions \
                     WHERE family LIKE ?1 AND status = ?2 \
                     GROUP BY family HAVING MIN(rowid) > ?3 \
                     ORDER BY first_row LIMIT ?4",
                )
                .map_err(db_err)?;
            let mut rows = stmt
                .query(params![like, status, after, page + 1])
                .map_err(db_err)?;
            let mut out = Vec::new();
            let mut last_id = after;
            while let Some(row) = rows.next().map_err(db_err)? {
                if out.len() as i64 == page {
                    return Ok((out, Some(token::encode(last_id, digest))));
                }
                last_id = row.get(0).map_err(db_err)?;
                out.push(row.get::<_, String>(1).map_err(db_err)?);
            }
            Ok((out, None))
        })
        .await
    }

    /// ARNs of a family's revisions, optionally status-filtered.
    pub async fn list_revisions(
        &self,
        family: Option<String>,
        status_filter: Option<String>,
        limit: Option<i64>,
        next_token: Option<String>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let digest = token::filter_digest([
            "revisions",
            family.as_deref().unwrap_or(""),
            status_filter.as_deref().unwrap_or(""),
        ]);
        let after = match next_token.as_deref() {
            Some(t) => token::decode(t, digest)?,
            None => 0,
        };
        let page = limit.unwrap_or(100).clamp(1, 100);
        run(&self.pool, move |conn| {
            let family_like = match family {
                Some(f) => f,
                None => "%".to_string(),
            };
            let status = status_filter.unwrap_or_else(|| status::ACTIVE.to_string());
            let mut stmt = conn
                .prepare_cached(
                    "SELECT rowid, arn FROM task_definitions \
                     WHERE family LIKE ?1 AND status = ?2 AND rowid > ?3 \
                     ORDER BY rowid LIMIT ?4",
                )
                .map_err(db_err)?;
            let mut rows = stmt
                .query(params![family_like, status, after, page + 1])
                .map_err(db_err)?;
            let mut out = Vec::new();
            let mut last_id = after;
            while let Some(row) = rows.next().map_err(db_err)? {
                if out.len() as i64 == page {
                    return Ok((out, Some(token::encode(last_id, digest))));
                }
                last_id = row.get(0).map_err(db_err)?;
                out.push(row.get::<_, String>(1).map_err(db_err)?);
            }
            Ok((out, None))
        })
        .await
    }

    /// Flip a revision INACTIVE. The revision stays in the family's dense
    /// sequence; nothing is renumbered.
    pub async fn deregister(&self, family: &str, revision: i64) -> Result<TaskDefinition> {
        let family = family.to_string();
        let now = kecs_common::now_ms();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE task_definitions SET status = ?3, deregistered_at = ?4 \
                     WHERE family = ?1 AND revision = ?2",
                )
                .map_err(db_err)?
                .execute(params![family, revision, status::INACTIVE, now])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(
                    entities::TASK_DEFINITION,
                    format!("{family}:{revision}"),
                ));
            }
            conn.prepare_cached(&format!(
                "SELECT {COLUMNS} FROM task_definitions WHERE family = ?1 AND revision = ?2"
            ))
            .map_err(db_err)?
            .query_row(params![family, revision], |row| {
                Ok(row_to_task_definition(row, 0))
            })
            .map_err(db_err)?
        })
        .await
    }

    /// Hard delete an INACTIVE revision (the DeleteTaskDefinitions path).
    pub async fn delete(&self, family: &str, revision: i64) -> Result<TaskDefinition> {
        let family = family.to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let td = tx
                .prepare_cached(&format!(
                    "SELECT {COLUMNS} FROM task_definitions WHERE family = ?1 AND revision = ?2"
                ))
                .map_err(db_err)?
                .query_row(params![family, revision], |row| {
                    Ok(row_to_task_definition(row, 0))
                })
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| {
                    Error::not_found(entities::TASK_DEFINITION, format!("{family}:{revision}"))
                })??;
            if td.status != status::INACTIVE {
                return Err(Error::invalid(format!(
                    "task definition {family}:{revision} must be deregistered before deletion"
                )));
            }
            tx.prepare_cached("DELETE FROM task_definitions WHERE family = ?1 AND revision = ?2")
                .map_err(db_err)?
                .execute(params![family, revision])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(td)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;
    use kecs_types::task_definition::{ContainerDefinition, network_mode};
    use kecs_types::{DEFAULT_ACCOUNT_ID, DEFAULT_REGION};

    pub(crate) fn sample(family: &str) -> TaskDefinition {
        TaskDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            arn: String::new(),
            family: family.to_string(),
            revision: 0,
            network_mode: network_mode::AWSVPC.to_string(),
            container_definitions: vec![ContainerDefinition {
                name: Some("app".to_string()),
                image: Some("nginx:latest".to_string()),
                cpu: 256,
                memory: Some(512),
                essential: Some(true),
                ..Default::default()
            }],
            volumes: Vec::new(),
            cpu: Some("256".to_string()),
            memory: Some("512".to_string()),
            task_role_arn: None,
            execution_role_arn: None,
            requires_compatibilities: vec!["FARGATE".to_string()],
            status: status::ACTIVE.to_string(),
            registered_at: 1,
            deregistered_at: None,
        }
    }

    async fn register(store: &TaskDefinitionStore, family: &str) -> TaskDefinition {
        store
            .register(sample(family), DEFAULT_REGION, DEFAULT_ACCOUNT_ID)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn revisions_are_dense_and_monotonic() {
        let (_dir, db) = scratch().await;
        let store = db.task_definitions();
        let first = register(&store, "web").await;
        let second = register(&store, "web").await;
        let other = register(&store, "worker").await;
        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(other.revision, 1);
        assert!(second.arn.ends_with("task-definition/web:2"));
    }

    #[tokio::test]
    async fn resolve_latest_and_pinned() {
        let (_dir, db) = scratch().await;
        let store = db.task_definitions();
        register(&store, "web").await;
        register(&store, "web").await;
        assert_eq!(store.resolve("web").await.unwrap().revision, 2);
        assert_eq!(store.resolve("web:1").await.unwrap().revision, 1);
        let err = store.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn deregister_keeps_sequence_dense() {
        let (_dir, db) = scratch().await;
        let store = db.task_definitions();
        register(&store, "web").await;
        register(&store, "web").await;
        let inactive = store.deregister("web", 1).await.unwrap();
        assert_eq!(inactive.status, status::INACTIVE);
        assert!(inactive.deregistered_at.is_some());
        // Deregistration does not free the revision number.
        let third = register(&store, "web").await;
        assert_eq!(third.revision, 3);
        // ACTIVE listing omits revision 1.
        let (arns, _) = store
            .list_revisions(Some("web".into()), None, None, None)
            .await
            .unwrap();
        assert!(!arns.iter().any(|a| a.ends_with(":1")));
        assert_eq!(arns.len(), 2);
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let (_dir, db) = scratch().await;
        let store = db.task_definitions();
        let stored = register(&store, "web").await;
        let got = store.get_by_arn(&stored.arn).await.unwrap();
        assert_eq!(got.container_definitions.len(), 1);
        assert_eq!(got.container_definitions[0].name.as_deref(), Some("app"));
        assert_eq!(got.container_definitions[0].cpu, 256);
        assert_eq!(got.requires_compatibilities, vec!["FARGATE".to_string()]);
    }

    #[tokio::test]
    async fn delete_requires_inactive() {
        let (_dir, db) = scratch().await;
        let store = db.task_definitions();
        register(&store, "web").await;
        assert!(matches!(
            store.delete("web", 1).await.unwrap_err(),
            Error::Invalid(_)
        ));
        store.deregister("web", 1).await.unwrap();
        store.delete("web", 1).await.unwrap();
        assert!(store.get("web", 1).await.is_err());
    }

    #[tokio::test]
    async fn list_families_prefix_and_paging() {
        let (_dir, db) = scratch().await;
        let store = db.task_definitions();
        for family in ["web", "web-admin", "worker", "batch"] {
            register(&store, family).await;
        }
        let (families, _) = store
            .list_families(Some("web".into()), None, None, None)
            .await
            .unwrap();
        assert_eq!(families.len(), 2);
        let (page, tok) = store
            .list_families(None, None, Some(2), None)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        let (rest, end) = store.list_families(None, None, Some(2), tok).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(end.is_none());
        assert!(page.iter().all(|f| !rest.contains(f)));
    }
}
