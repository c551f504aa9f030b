use kecs_types::service::{Service, scheduling_strategy, status};
use kecs_types::{Error, arn};

use super::models::*;
use super::resolve_cluster;
use crate::state::AppState;

/// Look up the balancer kind referenced by the service's load balancer
/// attachments, when one is registered with the ELBv2 bookkeeping. Drives
/// the Kubernetes Service type.
async fn balancer_type(state: &AppState, service: &Service) -> Option<String> {
    for lb in &service.load_balancers {
        if let Some(name) = &lb.load_balancer_name
            && let Ok(balancer) = state.elbv2.get_load_balancer(name).await
        {
            return Some(balancer.lb_type);
        }
    }
    None
}

/// Book the service's containers into their target groups. Bookkeeping
/// only; health starts `initial` and is reported later.
async fn register_lb_targets(state: &AppState, service: &Service) {
    for lb in &service.load_balancers {
        let (Some(tg), Some(port)) = (&lb.target_group_arn, lb.container_port) else {
            continue;
        };
        if let Err(e) = state
            .elbv2
            .register_targets(tg, vec![(service.service_name.clone(), Some(port))])
            .await
        {
            tracing::debug!(service = %service.service_name, error = %e, "target registration skipped");
        }
    }
}

async fn deregister_lb_targets(state: &AppState, service: &Service) {
    for lb in &service.load_balancers {
        let Some(tg) = &lb.target_group_arn else {
            continue;
        };
        if let Err(e) = state
            .elbv2
            .deregister_targets(tg, vec![service.service_name.clone()])
            .await
        {
            tracing::debug!(service = %service.service_name, error = %e, "target deregistration skipped");
        }
    }
}

/// Convert and apply the service's workload objects. Apply failures are
/// logged, not surfaced; the reconciler and a later update will retry.
async fn apply_workloads(state: &AppState, service: &Service) {
    let Some(workloads) = &state.workloads else {
        return;
    };
    let Ok(cluster) = state.db.clusters().get(&service.cluster_arn).await else {
        return;
    };
    let Ok(td) = state
        .db
        .task_definitions()
        .get_by_arn(&service.task_definition_arn)
        .await
    else {
        return;
    };
    match kecs_converter::deployment_for_service(service, &td, &cluster) {
        Ok(deployment) => {
            if let Err(e) = workloads.apply_deployment(&deployment).await {
                tracing::warn!(service = %service.service_name, error = %e, "deployment apply failed");
            }
        }
        Err(e) => {
            tracing::warn!(service = %service.service_name, error = %e, "deployment conversion failed")
        }
    }
    let lb_kind = balancer_type(state, service).await;
    match kecs_converter::kubernetes_service_for_service(service, &td, &cluster, lb_kind.as_deref())
    {
        Ok(Some(k8s_service)) => {
            if let Err(e) = workloads.apply_service(&k8s_service).await {
                tracing::warn!(service = %service.service_name, error = %e, "service apply failed");
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(service = %service.service_name, error = %e, "service conversion failed")
        }
    }
}

pub async fn create_service(
    state: &AppState,
    req: CreateServiceRequest,
) -> Result<ServiceResponse, Error> {
    if req.service_name.is_empty() {
        return Err(Error::invalid("serviceName must not be empty"));
    }
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let td = state
        .db
        .task_definitions()
        .resolve(&req.task_definition)
        .await?;

    let strategy = req
        .scheduling_strategy
        .unwrap_or_else(|| scheduling_strategy::REPLICA.to_string());
    if strategy != scheduling_strategy::REPLICA && strategy != scheduling_strategy::DAEMON {
        return Err(Error::invalid(format!(
            "unknown schedulingStrategy '{strategy}'"
        )));
    }

    let now = kecs_common::now_ms();
    let service = Service {
        id: uuid::Uuid::new_v4().to_string(),
        arn: arn::service(
            &state.region,
            &state.account_id,
            &cluster.name,
            &req.service_name,
        ),
        service_name: req.service_name,
        cluster_arn: cluster.arn.clone(),
        task_definition_arn: td.arn.clone(),
        desired_count: req.desired_count.unwrap_or(0),
        running_count: 0,
        pending_count: 0,
        launch_type: req.launch_type.unwrap_or_else(|| "FARGATE".to_string()),
        status: status::ACTIVE.to_string(),
        load_balancers: req.load_balancers,
        service_registries: req.service_registries,
        network_configuration: req.network_configuration,
        deployment_configuration: req.deployment_configuration,
        scheduling_strategy: strategy,
        role_arn: req.role,
        platform_version: req.platform_version,
        primary_task_set: None,
        created_at: now,
        updated_at: now,
    };
    let stored = state.db.services().create(service).await?;
    apply_workloads(state, &stored).await;
    register_lb_targets(state, &stored).await;
    state.hub.publish(
        "service_update",
        Some("service"),
        Some(&stored.service_name),
        serde_json::json!({"serviceArn": stored.arn, "status": stored.status, "desiredCount": stored.desired_count}),
    );
    tracing::info!(service = %stored.service_name, cluster = %cluster.name, "service created");
    Ok(ServiceResponse {
        service: ServiceWire::from(&stored),
    })
}

pub async fn update_service(
    state: &AppState,
    req: UpdateServiceRequest,
) -> Result<ServiceResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let mut service = state.db.services().get(&cluster.arn, &req.service).await?;
    if let Some(desired) = req.desired_count {
        if desired < 0 {
            return Err(Error::invalid("desiredCount must be non-negative"));
        }
        service.desired_count = desired;
    }
    if let Some(td_ref) = &req.task_definition {
        let td = state.db.task_definitions().resolve(td_ref).await?;
        service.task_definition_arn = td.arn;
    }
    if let Some(nc) = req.network_configuration {
        service.network_configuration = Some(nc);
    }
    if let Some(dc) = req.deployment_configuration {
        service.deployment_configuration = Some(dc);
    }
    let updated = state.db.services().update(service).await?;
    apply_workloads(state, &updated).await;
    state.hub.publish(
        "service_update",
        Some("service"),
        Some(&updated.service_name),
        serde_json::json!({"serviceArn": updated.arn, "desiredCount": updated.desired_count}),
    );
    Ok(ServiceResponse {
        service: ServiceWire::from(&updated),
    })
}

/// Delete drains first: desired count drops to zero and the row flips
/// INACTIVE; backing workload objects are removed best-effort.
pub async fn delete_service(
    state: &AppState,
    req: DeleteServiceRequest,
) -> Result<ServiceResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let service = state.db.services().get(&cluster.arn, &req.service).await?;
    if !req.force && service.running_count > 0 {
        return Err(Error::invalid(
            "service still has running tasks; scale down or pass force",
        ));
    }
    let deleted = state.db.services().delete(&cluster.arn, &req.service).await?;
    deregister_lb_targets(state, &deleted).await;
    if let Some(workloads) = &state.workloads {
        let namespace = kecs_types::cluster::namespace(&cluster);
        if let Err(e) = workloads
            .delete_deployment(&namespace, &deleted.service_name)
            .await
        {
            tracing::warn!(service = %deleted.service_name, error = %e, "deployment delete failed");
        }
    }
    state.hub.publish(
        "service_update",
        Some("service"),
        Some(&deleted.service_name),
        serde_json::json!({"serviceArn": deleted.arn, "status": deleted.status}),
    );
    Ok(ServiceResponse {
        service: ServiceWire::from(&deleted),
    })
}

pub async fn describe_services(
    state: &AppState,
    req: DescribeServicesRequest,
) -> Result<DescribeServicesResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let mut services = Vec::new();
    let mut failures = Vec::new();
    for reference in req.services {
        match state.db.services().get(&cluster.arn, &reference).await {
            Ok(s) => services.push(ServiceWire::from(&s)),
            Err(Error::NotFound { .. }) => failures.push(Failure::missing(reference)),
            Err(e) => return Err(e),
        }
    }
    Ok(DescribeServicesResponse { services, failures })
}

pub async fn list_services(
    state: &AppState,
    req: ListServicesRequest,
) -> Result<ListServicesResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let (services, next_token) = state
        .db
        .services()
        .list(&cluster.arn, req.launch_type, req.max_results, req.next_token)
        .await?;
    Ok(ListServicesResponse {
        service_arns: services.into_iter().map(|s| s.arn).collect(),
        next_token,
    })
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::api::tests::{call, test_state};

    async fn seed(app: &axum::Router) {
        call(app, "CreateCluster", serde_json::json!({"clusterName": "default"})).await;
        call(
            app,
            "RegisterTaskDefinition",
            serde_json::json!({
                "family": "web",
                "containerDefinitions": [{"name": "app", "image": "nginx:latest"}]
            }),
        )
        .await;
    }

    #[tokio::test]
    async fn service_lifecycle() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        seed(&app).await;

        let (status, body) = call(
            &app,
            "CreateService",
            serde_json::json!({
                "serviceName": "web",
                "taskDefinition": "web",
                "desiredCount": 2
            }),
        )
        .await;
        assert_eq!(status, http::StatusCode::OK);
        assert_eq!(body["service"]["desiredCount"], 2);
        assert_eq!(body["service"]["status"], "ACTIVE");
        assert_eq!(body["service"]["schedulingStrategy"], "REPLICA");

        let (_, body) = call(
            &app,
            "UpdateService",
            serde_json::json!({"service": "web", "desiredCount": 5}),
        )
        .await;
        assert_eq!(body["service"]["desiredCount"], 5);

        let (_, body) = call(
            &app,
            "DescribeServices",
            serde_json::json!({"services": ["web", "ghost"]}),
        )
        .await;
        assert_eq!(body["services"].as_array().unwrap().len(), 1);
        assert_eq!(body["failures"][0]["reason"], "MISSING");

        let (_, body) = call(
            &app,
            "DeleteService",
            serde_json::json!({"service": "web"}),
        )
        .await;
        assert_eq!(body["service"]["status"], "INACTIVE");
        assert_eq!(body["service"]["desiredCount"], 0);

        let (_, body) = call(&app, "ListServices", serde_json::json!({})).await;
        assert!(body["serviceArns"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_service_rejected() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        seed(&app).await;
        let body = serde_json::json!({"serviceName": "web", "taskDefinition": "web"});
        call(&app, "CreateService", body.clone()).await;
        let (status, resp) = call(&app, "CreateService", body).await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(resp["__type"], "InvalidParameterException");
    }

    #[tokio::test]
    async fn unknown_task_definition_rejected() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        call(&app, "CreateCluster", serde_json::json!({})).await;
        let (status, resp) = call(
            &app,
            "CreateService",
            serde_json::json!({"serviceName": "web", "taskDefinition": "ghost"}),
        )
        .await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(resp["__type"], "TaskDefinitionNotFoundException");
    }
}
