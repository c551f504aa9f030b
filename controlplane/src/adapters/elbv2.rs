//! L7 load-balancer bookkeeping. Unlike the other adapters this one is
//! storage-backed: the store rows are the source of truth and the ELBv2
//! emulator only ever mirrors them.

use kecs_storage::Elbv2Store;
use kecs_types::Result;
use kecs_types::elbv2::{Listener, LoadBalancer, Rule, Target, TargetGroup, target_health};

pub struct Elbv2Adapter {
    store: Elbv2Store,
    region: String,
    account_id: String,
}

impl Elbv2Adapter {
    pub fn new(store: Elbv2Store, region: String, account_id: String) -> Self {
        Self {
            store,
            region,
            account_id,
        }
    }

    fn suffix() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
    }

    pub async fn create_load_balancer(&self, name: &str, lb_type: &str) -> Result<LoadBalancer> {
        let suffix = Self::suffix();
        let kind = if lb_type == kecs_types::elbv2::lb_type::NETWORK {
            "net"
        } else {
            "app"
        };
        let lb = LoadBalancer {
            arn: format!(
                "arn:aws:elasticloadbalancing:{}:{}:loadbalancer/{kind}/{name}/{suffix}",
                self.region, self.account_id
            ),
            name: name.to_string(),
            dns_name: format!("{name}-{suffix}.elb.{}.localhost", self.region),
            lb_type: lb_type.to_string(),
            scheme: "internet-facing".to_string(),
            state: "active".to_string(),
            vpc_id: None,
            created_at: kecs_common::now_ms(),
        };
        self.store.create_load_balancer(lb).await
    }

    pub async fn get_load_balancer(&self, name_or_arn: &str) -> Result<LoadBalancer> {
        self.store.get_load_balancer(name_or_arn).await
    }

    pub async fn list_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        self.store.list_load_balancers().await
    }

    pub async fn delete_load_balancer(&self, arn: &str) -> Result<()> {
        self.store.delete_load_balancer(arn).await
    }

    pub async fn create_target_group(
        &self,
        name: &str,
        protocol: &str,
        port: i32,
    ) -> Result<TargetGroup> {
        let tg = TargetGroup {
            arn: format!(
                "arn:aws:elasticloadbalancing:{}:{}:targetgroup/{name}/{}",
                self.region,
                self.account_id,
                Self::suffix()
            ),
            name: name.to_string(),
            protocol: protocol.to_string(),
            port,
            target_type: "ip".to_string(),
            vpc_id: None,
            health_check_path: Some("/".to_string()),
            created_at: kecs_common::now_ms(),
        };
        self.store.create_target_group(tg).await
    }

    pub async fn delete_target_group(&self, arn: &str) -> Result<()> {
        self.store.delete_target_group(arn).await
    }

    pub async fn create_listener(
        &self,
        load_balancer_arn: &str,
        protocol: &str,
        port: i32,
        default_target_group_arn: Option<String>,
    ) -> Result<Listener> {
        let listener = Listener {
            arn: format!("{load_balancer_arn}/listener/{}", Self::suffix()),
            load_balancer_arn: load_balancer_arn.to_string(),
            protocol: protocol.to_string(),
            port,
            default_target_group_arn,
            created_at: kecs_common::now_ms(),
        };
        self.store.create_listener(listener).await
    }

    pub async fn create_rule(
        &self,
        listener_arn: &str,
        priority: i32,
        conditions: serde_json::Value,
        target_group_arn: Option<String>,
    ) -> Result<Rule> {
        let rule = Rule {
            arn: format!("{listener_arn}/rule/{}", Self::suffix()),
            listener_arn: listener_arn.to_string(),
            priority,
            conditions,
            target_group_arn,
            created_at: kecs_common::now_ms(),
        };
        self.store.create_rule(rule).await
    }

    /// Register backends; they start in `initial` health until reported
    /// otherwise.
    pub async fn register_targets(
        &self,
        target_group_arn: &str,
        targets: Vec<(String, Option<i32>)>,
    ) -> Result<()> {
        let now = kecs_common::now_ms();
        let rows = targets
            .into_iter()
            .map(|(id, port)| Target {
                target_group_arn: target_group_arn.to_string(),
                target_id: id,
                port,
                health: target_health::INITIAL.to_string(),
                registered_at: now,
            })
            .collect();
        self.store.register_targets(rows).await
    }

    pub async fn deregister_targets(
        &self,
        target_group_arn: &str,
        target_ids: Vec<String>,
    ) -> Result<()> {
        self.store
            .deregister_targets(target_group_arn, target_ids)
            .await
    }

    pub async fn report_target_health(
        &self,
        target_group_arn: &str,
        target_id: &str,
        health: &str,
    ) -> Result<()> {
        self.store
            .set_target_health(target_group_arn, target_id, health)
            .await
    }

    pub async fn describe_target_health(&self, target_group_arn: &str) -> Result<Vec<Target>> {
        self.store.list_targets(target_group_arn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kecs_storage::Database;
    use kecs_types::elbv2::lb_type;

    async fn adapter() -> (tempfile::TempDir, Elbv2Adapter) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("kecs.db")).await.unwrap();
        let adapter = Elbv2Adapter::new(
            db.elbv2(),
            kecs_types::DEFAULT_REGION.to_string(),
            kecs_types::DEFAULT_ACCOUNT_ID.to_string(),
        );
        (dir, adapter)
    }

    #[tokio::test]
    async fn full_bookkeeping_flow() {
        let (_dir, adapter) = adapter().await;
        let lb = adapter
            .create_load_balancer("web", lb_type::APPLICATION)
            .await
            .unwrap();
        assert!(lb.arn.contains(":loadbalancer/app/web/"));
        assert!(lb.dns_name.starts_with("web-"));

        let tg = adapter.create_target_group("web-tg", "HTTP", 80).await.unwrap();
        let listener = adapter
            .create_listener(&lb.arn, "HTTP", 80, Some(tg.arn.clone()))
            .await
            .unwrap();
        adapter
            .create_rule(
                &listener.arn,
                10,
                serde_json::json!([{"field": "path-pattern", "values": ["/api/*"]}]),
                Some(tg.arn.clone()),
            )
            .await
            .unwrap();

        adapter
            .register_targets(&tg.arn, vec![("10.0.0.1".to_string(), Some(8080))])
            .await
            .unwrap();
        adapter
            .report_target_health(&tg.arn, "10.0.0.1", target_health::HEALTHY)
            .await
            .unwrap();
        let health = adapter.describe_target_health(&tg.arn).await.unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].health, target_health::HEALTHY);
    }
}
