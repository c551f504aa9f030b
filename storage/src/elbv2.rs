//! Storage for the L7 load-balancer family.

use deadpool_sqlite::Pool;
use kecs_types::elbv2::{Listener, LoadBalancer, Rule, Target, TargetGroup};
use kecs_types::error::entities;
use kecs_types::{Error, Result};
use rusqlite::{OptionalExtension, Row, params};

use crate::{db_err, from_blob, run, to_blob};

#[derive(Clone)]
pub struct Elbv2Store {
    pool: Pool,
}

fn row_to_lb(row: &Row) -> Result<LoadBalancer> {
    Ok(LoadBalancer {
        arn: row.get(0).map_err(db_err)?,
        name: row.get(1).map_err(db_err)?,
        dns_name: row.get(2).map_err(db_err)?,
        lb_type: row.get(3).map_err(db_err)?,
        scheme: row.get(4).map_err(db_err)?,
        state: row.get(5).map_err(db_err)?,
        vpc_id: row.get(6).map_err(db_err)?,
        created_at: row.get(7).map_err(db_err)?,
    })
}

fn row_to_target_group(row: &Row) -> Result<TargetGroup> {
    Ok(TargetGroup {
        arn: row.get(0).map_err(db_err)?,
        name: row.get(1).map_err(db_err)?,
        protocol: row.get(2).map_err(db_err)?,
        port: row.get(3).map_err(db_err)?,
        target_type: row.get(4).map_err(db_err)?,
        vpc_id: row.get(5).map_err(db_err)?,
        health_check_path: row.get(6).map_err(db_err)?,
        created_at: row.get(7).map_err(db_err)?,
    })
}

fn row_to_listener(row: &Row) -> Result<Listener> {
    Ok(Listener {
        arn: row.get(0).map_err(db_err)?,
        load_balancer_arn: row.get(1).map_err(db_err)?,
        protocol: row.get(2).map_err(db_err)?,
        port: row.get(3).map_err(db_err)?,
        default_target_group_arn: row.get(4).map_err(db_err)?,
        created_at: row.get(5).map_err(db_err)?,
    })
}

fn row_to_rule(row: &Row) -> Result<Rule> {
    let conditions: String = row.get(3).map_err(db_err)?;
    Ok(Rule {
        arn: row.get(0).map_err(db_err)?,
        listener_arn: row.get(1).map_err(db_err)?,
        priority: row.get(2).map_err(db_err)?,
        conditions: from_blob(&conditions)?,
        target_group_arn: row.get(4).map_err(db_err)?,
        created_at: row.get(5).map_err(db_err)?,
    })
}

fn row_to_target(row: &Row) -> Result<Target> {
    Ok(Target {
        target_group_arn: row.get(0).map_err(db_err)?,
        target_id: row.get(1).map_err(db_err)?,
        port: row.get(2).map_err(db_err)?,
        health: row.get(3).map_err(db_err)?,
        registered_at: row.get(4).map_err(db_err)?,
    })
}

impl Elbv2Store {
    pub(crate) fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn create_load_balancer(&self, lb: LoadBalancer) -> Result<LoadBalancer> {
        run(&self.pool, move |conn| {
            let exists: Option<String> = conn
                .prepare_cached("SELECT arn FROM load_balancers WHERE name = ?1")
                .map_err(db_err)?
                .query_row(params![lb.name], |r| r.get(0))
                .optional()
                .map_err(db_err)?;
            if exists.is_some() {
                return Err(Error::already_exists(entities::LOAD_BALANCER, &lb.name));
            }
            conn.prepare_cached(
                "INSERT INTO load_balancers (arn, name, dns_name, lb_type, scheme, state, \
                 vpc_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(db_err)?
            .execute(params![
                lb.arn,
                lb.name,
                lb.dns_name,
                lb.lb_type,
                lb.scheme,
                lb.state,
                lb.vpc_id,
                lb.created_at,
            ])
            .map_err(db_err)?;
            Ok(lb)
        })
        .await
    }

    pub async fn get_load_balancer(&self, arn: &str) -> Result<LoadBalancer> {
        let arn = arn.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "SELECT arn, name, dns_name, lb_type, scheme, state, vpc_id, created_at \
                 FROM load_balancers WHERE arn = ?1 OR name = ?1",
            )
            .map_err(db_err)?
            .query_row(params![arn], |row| Ok(row_to_lb(row)))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::LOAD_BALANCER, &arn))?
        })
        .await
    }

    pub async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT arn, name, dns_name, lb_type, scheme, state, vpc_id, created_at \
                     FROM load_balancers ORDER BY rowid",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query([]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(row_to_lb(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Delete cascades to listeners and their rules.
    pub async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        let arn = arn.to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let changed = tx
                .prepare_cached("DELETE FROM load_balancers WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::LOAD_BALANCER, &arn));
            }
            tx.prepare_cached(
                "DELETE FROM rules WHERE listener_arn IN \
                 (SELECT arn FROM listeners WHERE load_balancer_arn = ?1)",
            )
            .map_err(db_err)?
            .execute(params![arn])
            .map_err(db_err)?;
            tx.prepare_cached("DELETE FROM listeners WHERE load_balancer_arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn create_target_group(&self, tg: TargetGroup) -> Result<TargetGroup> {
        run(&self.pool, move |conn| {
            let exists: Option<String> = conn
                .prepare_cached("SELECT arn FROM target_groups WHERE name = ?1")
                .map_err(db_err)?
                .query_row(params![tg.name], |r| r.get(0))
                .optional()
                .map_err(db_err)?;
            if exists.is_some() {
                return Err(Error::already_exists(entities::TARGET_GROUP, &tg.name));
            }
            conn.prepare_cached(
                "INSERT INTO target_groups (arn, name, protocol, port, target_type, vpc_id, \
                 health_check_path, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(db_err)?
            .execute(params![
                tg.arn,
                tg.name,
                tg.protocol,
                tg.port,
                tg.target_type,
                tg.vpc_id,
                tg.health_check_path,
                tg.created_at,
            ])
            .map_err(db_err)?;
            Ok(tg)
        })
        .await
    }

    pub async fn get_target_group(&self, arn: &str) -> Result<TargetGroup> {
        let arn = arn.to_string();
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "SELECT arn, name, protocol, port, target_type, vpc_id, health_check_path, \
                 created_at FROM target_groups WHERE arn = ?1 OR name = ?1",
            )
            .map_err(db_err)?
            .query_row(params![arn], |row| Ok(row_to_target_group(row)))
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| Error::not_found(entities::TARGET_GROUP, &arn))?
        })
        .await
    }

    pub async fn delete_target_group(&self, arn: &str) -> Result<()> {
        let arn = arn.to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let changed = tx
                .prepare_cached("DELETE FROM target_groups WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::TARGET_GROUP, &arn));
            }
            tx.prepare_cached("DELETE FROM targets WHERE target_group_arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn create_listener(&self, listener: Listener) -> Result<Listener> {
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "INSERT INTO listeners (arn, load_balancer_arn, protocol, port, \
                 default_target_group_arn, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(db_err)?
            .execute(params![
                listener.arn,
                listener.load_balancer_arn,
                listener.protocol,
                listener.port,
                listener.default_target_group_arn,
                listener.created_at,
            ])
            .map_err(db_err)?;
            Ok(listener)
        })
        .await
    }

    pub async fn list_listeners(&self, load_balancer_arn: &str) -> Result<Vec<Listener>> {
        let lb = load_balancer_arn.to_string();
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT arn, load_balancer_arn, protocol, port, default_target_group_arn, \
                     created_at FROM listeners WHERE load_balancer_arn = ?1 ORDER BY rowid",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query(params![lb]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(row_to_listener(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn delete_listener(&self, arn: &str) -> Result<()> {
        let arn = arn.to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            let changed = tx
                .prepare_cached("DELETE FROM listeners WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::LISTENER, &arn));
            }
            tx.prepare_cached("DELETE FROM rules WHERE listener_arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn create_rule(&self, rule: Rule) -> Result<Rule> {
        run(&self.pool, move |conn| {
            conn.prepare_cached(
                "INSERT INTO rules (arn, listener_arn, priority, conditions, \
                 target_group_arn, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(db_err)?
            .execute(params![
                rule.arn,
                rule.listener_arn,
                rule.priority,
                to_blob(&rule.conditions)?,
                rule.target_group_arn,
                rule.created_at,
            ])
            .map_err(db_err)?;
            Ok(rule)
        })
        .await
    }

    pub async fn list_rules(&self, listener_arn: &str) -> Result<Vec<Rule>> {
        let listener = listener_arn.to_string();
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT arn, listener_arn, priority, conditions, target_group_arn, \
                     created_at FROM rules WHERE listener_arn = ?1 ORDER BY priority",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query(params![listener]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(row_to_rule(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn delete_rule(&self, arn: &str) -> Result<()> {
        let arn = arn.to_string();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached("DELETE FROM rules WHERE arn = ?1")
                .map_err(db_err)?
                .execute(params![arn])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::RULE, &arn));
            }
            Ok(())
        })
        .await
    }

    pub async fn register_targets(&self, targets: Vec<Target>) -> Result<()> {
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for target in targets {
                tx.prepare_cached(
                    "INSERT INTO targets (target_group_arn, target_id, port, health, \
                     registered_at) VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT (target_group_arn, target_id) \
                     DO UPDATE SET port = excluded.port, health = excluded.health",
                )
                .map_err(db_err)?
                .execute(params![
                    target.target_group_arn,
                    target.target_id,
                    target.port,
                    target.health,
                    target.registered_at,
                ])
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn deregister_targets(
        &self,
        target_group_arn: &str,
        target_ids: Vec<String>,
    ) -> Result<()> {
        let tg = target_group_arn.to_string();
        run(&self.pool, move |conn| {
            let tx = conn.transaction().map_err(db_err)?;
            for id in target_ids {
                tx.prepare_cached(
                    "DELETE FROM targets WHERE target_group_arn = ?1 AND target_id = ?2",
                )
                .map_err(db_err)?
                .execute(params![tg, id])
                .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    pub async fn set_target_health(
        &self,
        target_group_arn: &str,
        target_id: &str,
        health: &str,
    ) -> Result<()> {
        let tg = target_group_arn.to_string();
        let id = target_id.to_string();
        let health = health.to_string();
        run(&self.pool, move |conn| {
            let changed = conn
                .prepare_cached(
                    "UPDATE targets SET health = ?3 \
                     WHERE target_group_arn = ?1 AND target_id = ?2",
                )
                .map_err(db_err)?
                .execute(params![tg, id, health])
                .map_err(db_err)?;
            if changed == 0 {
                return Err(Error::not_found(entities::TARGET_GROUP, format!("{tg}/{id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn list_targets(&self, target_group_arn: &str) -> Result<Vec<Target>> {
        let tg = target_group_arn.to_string();
        run(&self.pool, move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT target_group_arn, target_id, port, health, registered_at \
                     FROM targets WHERE target_group_arn = ?1 ORDER BY rowid",
                )
                .map_err(db_err)?;
            let mut rows = stmt.query(params![tg]).map_err(db_err)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(db_err)? {
                out.push(row_to_target(row)?);
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
    use kecs_types::elbv2::{lb_type, target_health};

    fn lb(name: &str) -> LoadBalancer {
        LoadBalancer {
            arn: format!(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:loadbalancer/app/{name}/1"
            ),
            name: name.to_string(),
            dns_name: format!("{name}.elb.localhost.localstack.cloud"),
            lb_type: lb_type::APPLICATION.to_string(),
            scheme: "internet-facing".to_string(),
            state: "active".to_string(),
            vpc_id: None,
            created_at: 1,
        }
    }

    fn tg(name: &str) -> TargetGroup {
        TargetGroup {
            arn: format!(
                "arn:aws:elasticloadbalancing:us-east-1:000000000000:targetgroup/{name}/1"
            ),
            name: name.to_string(),
            protocol: "HTTP".to_string(),
            port: 80,
            target_type: "ip".to_string(),
            vpc_id: None,
            health_check_path: Some("/health".to_string()),
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn lb_listener_rule_cascade() {
        let (_dir, db) = scratch().await;
        let store = db.elbv2();
        let balancer = store.create_load_balancer(lb("web")).await.unwrap();
        let listener = store
            .create_listener(Listener {
                arn: "arn:listener/1".to_string(),
                load_balancer_arn: balancer.arn.clone(),
                protocol: "HTTP".to_string(),
                port: 80,
                default_target_group_arn: None,
                created_at: 1,
            })
            .await
            .unwrap();
        store
            .create_rule(Rule {
                arn: "arn:rule/1".to_string(),
                listener_arn: listener.arn.clone(),
                priority: 10,
                conditions: serde_json::json!([{"field": "path-pattern", "values": ["/api/*"]}]),
                target_group_arn: None,
                created_at: 1,
            })
            .await
            .unwrap();

        store.delete_load_balancer(&balancer.arn).await.unwrap();
        assert!(store.list_listeners(&balancer.arn).await.unwrap().is_empty());
        assert!(store.list_rules(&listener.arn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn target_registration_keyed_by_group_and_id() {
        let (_dir, db) = scratch().await;
        let store = db.elbv2();
        let group = store.create_target_group(tg("api")).await.unwrap();
        store
            .register_targets(vec![Target {
                target_group_arn: group.arn.clone(),
                target_id: "10.0.0.1".to_string(),
                port: Some(8080),
                health: target_health::INITIAL.to_string(),
                registered_at: 1,
            }])
            .await
            .unwrap();
        // Re-registration updates in place.
        store
            .register_targets(vec![Target {
                target_group_arn: group.arn.clone(),
                target_id: "10.0.0.1".to_string(),
                port: Some(9090),
                health: target_health::INITIAL.to_string(),
                registered_at: 2,
            }])
            .await
            .unwrap();
        store
            .set_target_health(&group.arn, "10.0.0.1", target_health::HEALTHY)
            .await
            .unwrap();

        let targets = store.list_targets(&group.arn).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].port, Some(9090));
        assert_eq!(targets[0].health, target_health::HEALTHY);

        store
            .deregister_targets(&group.arn, vec!["10.0.0.1".to_string()])
            .await
            .unwrap();
        assert!(store.list_targets(&group.arn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_rejected() {
        let (_dir, db) = scratch().await;
        let store = db.elbv2();
        store.create_load_balancer(lb("web")).await.unwrap();
        assert!(matches!(
            store.create_load_balancer(lb("web")).await.unwrap_err(),
            Error::AlreadyExists { .. }
        ));
        store.create_target_group(tg("api")).await.unwrap();
        assert!(matches!(
            store.create_target_group(tg("api")).await.unwrap_err(),
            Error::AlreadyExists { .. }
        ));
    }
}
