use kecs_types::task_set::{Scale, TaskSet, stability_status, status};
use kecs_types::{Error, arn};

use super::models::*;
use super::resolve_cluster;
use crate::state::AppState;

fn computed_desired_count(scale: &Option<Scale>, service_desired: i64) -> i64 {
    let percent = scale
        .as_ref()
        .and_then(|s| s.value)
        .unwrap_or(100.0)
        .clamp(0.0, 100.0);
    ((service_desired as f64) * percent / 100.0).ceil() as i64
}

pub async fn create_task_set(
    state: &AppState,
    req: CreateTaskSetRequest,
) -> Result<TaskSetResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let service = state.db.services().get(&cluster.arn, &req.service).await?;
    let td = state
        .db
        .task_definitions()
        .resolve(&req.task_definition)
        .await?;

    let id = format!("ts-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let now = kecs_common::now_ms();
    let task_set = TaskSet {
        arn: arn::task_set(
            &state.region,
            &state.account_id,
            &cluster.name,
            &service.service_name,
            &id,
        ),
        id,
        service_arn: service.arn.clone(),
        cluster_arn: cluster.arn.clone(),
        external_id: req.external_id,
        task_definition: td.arn.clone(),
        computed_desired_count: computed_desired_count(&req.scale, service.desired_count),
        scale: req.scale,
        running_count: 0,
        pending_count: 0,
        status: status::ACTIVE.to_string(),
        stability_status: stability_status::STABILIZING.to_string(),
        network_configuration: req.network_configuration,
        load_balancers: req.load_balancers,
        service_registries: req.service_registries,
        launch_type: req
            .launch_type
            .unwrap_or_else(|| service.launch_type.clone()),
        created_at: now,
        updated_at: now,
    };
    let stored = state.db.task_sets().create(task_set).await?;

    if let Some(workloads) = &state.workloads {
        match kecs_converter::deployment_for_task_set(&stored, &service, &td, &cluster) {
            Ok(deployment) => {
                if let Err(e) = workloads.apply_deployment(&deployment).await {
                    tracing::warn!(task_set = %stored.id, error = %e, "task set deployment apply failed");
                }
            }
            Err(e) => {
                tracing::warn!(task_set = %stored.id, error = %e, "task set conversion failed")
            }
        }
        for endpoints in kecs_converter::endpoints_for_task_set(&stored, &cluster) {
            if let Err(e) = workloads.apply_endpoints(&endpoints).await {
                tracing::warn!(task_set = %stored.id, error = %e, "endpoints apply failed");
            }
        }
    }
    tracing::info!(task_set = %stored.id, service = %service.service_name, "task set created");
    Ok(TaskSetResponse {
        task_set: TaskSetWire::from(&stored),
    })
}

/// Remove a task set. The owning service's primary pointer is left as-is
/// even when it referenced the deleted set; observers may see a dangling
/// primary.
pub async fn delete_task_set(
    state: &AppState,
    req: DeleteTaskSetRequest,
) -> Result<TaskSetResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let service = state.db.services().get(&cluster.arn, &req.service).await?;
    let existing = state
        .db
        .task_sets()
        .get(&service.arn, &req.task_set)
        .await?;
    if !req.force && existing.status == status::PRIMARY {
        return Err(Error::invalid(
            "task set is PRIMARY; pass force to delete it",
        ));
    }
    let deleted = state
        .db
        .task_sets()
        .delete(&service.arn, &req.task_set)
        .await?;
    if let Some(workloads) = &state.workloads {
        let namespace = kecs_types::cluster::namespace(&cluster);
        let name = format!("{}-{}", service.service_name, deleted.id);
        if let Err(e) = workloads.delete_deployment(&namespace, &name).await {
            tracing::warn!(task_set = %deleted.id, error = %e, "task set deployment delete failed");
        }
    }
    Ok(TaskSetResponse {
        task_set: TaskSetWire::from(&deleted),
    })
}

pub async fn describe_task_sets(
    state: &AppState,
    req: DescribeTaskSetsRequest,
) -> Result<DescribeTaskSetsResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let service = state.db.services().get(&cluster.arn, &req.service).await?;
    let requested = req.task_sets.clone();
    let found = state
        .db
        .task_sets()
        .list(&service.arn, req.task_sets)
        .await?;
    let failures = match requested {
        Some(ids) => ids
            .into_iter()
            .filter(|id| {
                !found
                    .iter()
                    .any(|ts| ts.id == arn::resource_name(id) || &ts.arn == id)
            })
            .map(Failure::missing)
            .collect(),
        None => Vec::new(),
    };
    Ok(DescribeTaskSetsResponse {
        task_sets: found.iter().map(TaskSetWire::from).collect(),
        failures,
    })
}

pub async fn update_primary(
    state: &AppState,
    req: UpdateServicePrimaryTaskSetRequest,
) -> Result<TaskSetResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let service = state.db.services().get(&cluster.arn, &req.service).await?;
    let primary = state
        .db
        .task_sets()
        .update_primary(&service.arn, &req.primary_task_set)
        .await?;
    Ok(TaskSetResponse {
        task_set: TaskSetWire::from(&primary),
    })
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::api::tests::{call, test_state};

    async fn seed(app: &axum::Router) {
        call(app, "CreateCluster", serde_json::json!({})).await;
        call(
            app,
            "RegisterTaskDefinition",
            serde_json::json!({
                "family": "web",
                "containerDefinitions": [{"name": "app", "image": "nginx:latest"}]
            }),
        )
        .await;
        call(
            app,
            "CreateService",
            serde_json::json!({"serviceName": "web", "taskDefinition": "web", "desiredCount": 4}),
        )
        .await;
    }

    #[tokio::test]
    async fn blue_green_flow() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        seed(&app).await;

        let (status, blue) = call(
            &app,
            "CreateTaskSet",
            serde_json::json!({
                "service": "web",
                "taskDefinition": "web",
                "scale": {"value": 50.0, "unit": "PERCENT"}
            }),
        )
        .await;
        assert_eq!(status, http::StatusCode::OK);
        // 50% of desiredCount 4 = 2.
        assert_eq!(blue["taskSet"]["computedDesiredCount"], 2);
        let blue_id = blue["taskSet"]["id"].as_str().unwrap().to_string();

        let (_, primary) = call(
            &app,
            "UpdateServicePrimaryTaskSet",
            serde_json::json!({"service": "web", "primaryTaskSet": blue_id}),
        )
        .await;
        assert_eq!(primary["taskSet"]["status"], "PRIMARY");

        let (_, described) = call(
            &app,
            "DescribeTaskSets",
            serde_json::json!({"service": "web"}),
        )
        .await;
        assert_eq!(described["taskSets"].as_array().unwrap().len(), 1);

        // Deleting the primary without force is refused.
        let (status, _) = call(
            &app,
            "DeleteTaskSet",
            serde_json::json!({"service": "web", "taskSet": blue_id}),
        )
        .await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);

        // Forced deletion succeeds and leaves the service pointer dangling.
        let (_, deleted) = call(
            &app,
            "DeleteTaskSet",
            serde_json::json!({"service": "web", "taskSet": blue_id, "force": true}),
        )
        .await;
        assert_eq!(deleted["taskSet"]["id"].as_str().unwrap(), blue_id);
        let (_, svc) = call(
            &app,
            "DescribeServices",
            serde_json::json!({"services": ["web"]}),
        )
        .await;
        let dangling = svc["services"][0]["primaryTaskSet"].as_str().unwrap();
        assert!(dangling.ends_with(&blue_id));
    }

    #[tokio::test]
    async fn describe_reports_missing_ids() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        seed(&app).await;
        let (_, described) = call(
            &app,
            "DescribeTaskSets",
            serde_json::json!({"service": "web", "taskSets": ["ts-nope"]}),
        )
        .await;
        assert!(described["taskSets"].as_array().unwrap().is_empty());
        assert_eq!(described["failures"][0]["arn"], "ts-nope");
    }
}
