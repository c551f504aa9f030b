use deadpool_sqlite::Pool;
use kecs_types::attribute::Attribute;
use kecs_types::{Error, Result};
use rusqlite::params;

use crate::{db_err, run};

#[derive(Clone)]
pub struct AttributeStore {
    pool: Pool,
}

impl AttributeStore {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Batch upsert. The whole batch lands in one transaction; uniqueness
    /// on `(name, target_type, target_id, cluster)` makes replays
    /// idempotent.
    pub async fn put(&self, attributes: Vec<Attribute>) -> Result<Vec<Attribute>> {
        for attr in &attributes {
            if attr.name.is_empty() {
                return Err(Error::invalid("attribute name must not be empty"));
            }
        }
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let mut stored = Vec::with_capacity(attributes.len());
            for mut attr in attributes {
                if attr.id.is_none() {
                    attr.id = Some(uuid::Uuid::new_v4().to_string());
                }
                tx.prepare_cached(
                    "INSERT INTO attributes (id, name, value, target_type, target_id, cluster) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT (name, target_type, target_id, cluster) \
                     DO UPDATE SET value = excluded.value",
                )
                .map_err(db_err)?
                .execute(params![
                    attr.id,
                    attr.name,
                    attr.value,
                    attr.target_type.as_deref().unwrap_or(""),
                    attr.target_id.as_deref().unwrap_or(""),
                    attr.cluster,
                ])
                .map_err(db_err)?;
                stored.push(attr);
            }
            tx.commit().map_err(db_err)?;
            Ok(stored)
        })
        .await
    }

    /// Batch delete; unknown attributes are skipped silently.
    pub async fn delete(&self, attributes: Vec<Attribute>) -> Result<()> {
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for attr in attributes {
                tx.prepare_cached(
                    "DELETE FROM attributes WHERE name = ?1 AND target_type = ?2 \
                     AND target_id = ?3 AND cluster = ?4",
                )
                .map_err(db_err)?
                .execute(params![
                    attr.name,
                    attr.target_type.as_deref().unwrap_or(""),
                    attr.target_id.as_deref().unwrap_or(""),
                    attr.cluster,
                ])
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn list(
        &self,
        cluster: &str,
        target_type: Option<String>,
        name: Option<String>,
    ) -> Result<Vec<Attribute>> {
        let cluster = cluster.to_string();
        run(&self.pool, move |conn| {
            let target = target_type.unwrap_or_else(|| "%".to_string());
            let name = name.unwrap_or_else(|| "%".to_string());
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, name, value, target_type, target_id, cluster FROM attributes \
                     WHERE cluster = ?1 AND target_type LIKE ?2 AND name LIKE ?3 ORDER BY rowid",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query(params![cluster, target, name]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(Attribute {
                    id: row.get(0).map_err(db_err)?,
                    name: row.get(1).map_err(db_err)?,
                    value: row.get(2).map_err(db_err)?,
                    target_type: row.get(3).map_err(db_err)?,
                    target_id: row.get(4).map_err(db_err)?,
                    cluster: row.get(5).map_err(db_err)?,
                });
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch;

    fn sample(name: &str, target_id: &str, value: &str) -> Attribute {
        Attribute {
            id: None,
            name: name.to_string(),
            value: Some(value.to_string()),
            target_type: Some("container-instance".to_string()),
            target_id: Some(target_id.to_string()),
            cluster: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_key() {
        let (_dir, db) = scratch().await;
        let store = db.attributes();
        store
            .put(vec![sample("zone", "i-1", "a"), sample("zone", "i-2", "a")])
            .await
            .unwrap();
        // Replaying the same key updates the value instead of duplicating.
        store.put(vec![sample("zone", "i-1", "b")]).await.unwrap();

        let all = store.list("default", None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let i1 = all.iter().find(|a| a.target_id.as_deref() == Some("i-1"));
        assert_eq!(i1.unwrap().value.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn batch_delete_and_filters() {
        let (_dir, db) = scratch().await;
        let store = db.attributes();
        store
            .put(vec![sample("zone", "i-1", "a"), sample("rack", "i-1", "r1")])
            .await
            .unwrap();
        let zones = store
            .list("default", None, Some("zone".to_string()))
            .await
            .unwrap();
        assert_eq!(zones.len(), 1);
        store.delete(vec![sample("zone", "i-1", "a")]).await.unwrap();
        let rest = store.list("default", None, None).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "rack");
    }

    #[tokio::test]
    async fn empty_name_rejected() {
        let (_dir, db) = scratch().await;
        let err = db
            .attributes()
            .put(vec![sample("", "i-1", "a")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
