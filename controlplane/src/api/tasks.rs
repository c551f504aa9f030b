use kecs_storage::TaskFilters;
use kecs_types::task::{ContainerSnapshot, Task, connectivity, status};
use kecs_types::{Error, arn};

use super::models::*;
use super::resolve_cluster;
use crate::state::AppState;

/// Launch `count` tasks from a task definition. Each task starts in
/// PROVISIONING with desired RUNNING; the reconciler drives it from
/// there. When a cluster is attached the backing pod is created here,
/// best-effort.
pub async fn run_task(state: &AppState, req: RunTaskRequest) -> Result<RunTaskResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let td = state
        .db
        .task_definitions()
        .resolve(&req.task_definition)
        .await?;
    let count = req.count.unwrap_or(1);
    if !(1..=10).contains(&count) {
        return Err(Error::invalid("count must be between 1 and 10"));
    }

    let mut tasks = Vec::new();
    for _ in 0..count {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = kecs_common::now_ms();
        let containers = td
            .container_definitions
            .iter()
            .map(|def| ContainerSnapshot {
                container_arn: None,
                name: def.name.clone().unwrap_or_default(),
                image: def.image.clone(),
                last_status: status::PROVISIONING.to_string(),
                exit_code: None,
                reason: None,
            })
            .collect();
        let mut task = Task {
            arn: arn::task(&state.region, &state.account_id, &cluster.name, &id),
            id,
            cluster_arn: cluster.arn.clone(),
            task_definition_arn: td.arn.clone(),
            container_instance_arn: None,
            last_status: status::PROVISIONING.to_string(),
            desired_status: status::RUNNING.to_string(),
            containers,
            launch_type: req.launch_type.clone().unwrap_or_else(|| "FARGATE".to_string()),
            started_by: req.started_by.clone(),
            stopped_reason: None,
            stop_code: None,
            connectivity: Some(connectivity::CONNECTED.to_string()),
            pull_started_at: None,
            pull_stopped_at: None,
            started_at: None,
            stopping_at: None,
            stopped_at: None,
            execution_stopped_at: None,
            pod_name: None,
            namespace: None,
            version: 1,
            created_at: now,
        };

        // The pod conversion both validates the definition and names the
        // backing pod.
        let mut pod = kecs_converter::pod_for_task(&task, &td, &cluster)?;
        task.pod_name = pod.metadata.name.clone();
        task.namespace = pod.metadata.namespace.clone();
        inject_role_credentials(state, &td, &mut pod).await;

        let stored = state.db.tasks().create(task).await?;
        ensure_log_streams(state, &stored).await;
        if let Some(workloads) = &state.workloads {
            if let Err(e) = workloads.apply_pod(&pod).await {
                tracing::warn!(task = %stored.arn, error = %e, "pod apply failed");
            }
        }
        state.hub.publish(
            "task_update",
            Some("task"),
            Some(&stored.id),
            serde_json::json!({
                "taskArn": stored.arn,
                "lastStatus": stored.last_status,
                "desiredStatus": stored.desired_status,
            }),
        );
        tracing::info!(task = %stored.arn, family = %td.family, "task launched");
        tasks.push(TaskWire::from(&stored));
    }
    Ok(RunTaskResponse {
        tasks,
        failures: Vec::new(),
    })
}

/// When the task definition names a task or execution role, resolve it
/// through the credential adapter and inject the `AWS_*` triplet into
/// every container. Failures degrade to an uncredentialed pod.
async fn inject_role_credentials(
    state: &AppState,
    td: &kecs_types::task_definition::TaskDefinition,
    pod: &mut k8s_openapi::api::core::v1::Pod,
) {
    let Some(credentials) = &state.credentials else {
        return;
    };
    let Some(role) = td.task_role_arn.as_ref().or(td.execution_role_arn.as_ref()) else {
        return;
    };
    match credentials.assume_role(role).await {
        Ok(issued) => {
            if let Some(spec) = pod.spec.as_mut() {
                for container in &mut spec.containers {
                    let env = container.env.get_or_insert_with(Vec::new);
                    for (name, value) in issued.env_vars() {
                        env.push(k8s_openapi::api::core::v1::EnvVar {
                            name,
                            value: Some(value),
                            ..Default::default()
                        });
                    }
                }
            }
        }
        Err(e) => tracing::warn!(%role, error = %e, "role credential issuance failed"),
    }
}

/// Provision the task's log group and one stream per container through
/// the log emulator, best-effort.
async fn ensure_log_streams(state: &AppState, task: &Task) {
    let Some(logs) = &state.logs else {
        return;
    };
    let group = crate::adapters::logs::log_group_for(&task.arn);
    if let Err(e) = logs.ensure_log_group(&group).await {
        tracing::warn!(%group, error = %e, "log group provisioning failed");
        return;
    }
    for container in &task.containers {
        let stream = crate::adapters::logs::log_stream_for(&task.arn, &container.name);
        if let Err(e) = logs.ensure_log_stream(&group, &stream).await {
            tracing::warn!(%stream, error = %e, "log stream provisioning failed");
        }
    }
}

/// Flip desired status to STOPPED; the reconciler performs the actual
/// transition. Competing writers are retried through the version CAS.
pub async fn stop_task(state: &AppState, req: StopTaskRequest) -> Result<StopTaskResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let store = state.db.tasks();
    for _ in 0..3 {
        let mut task = store.get(&cluster.arn, &req.task).await?;
        if task.last_status == status::STOPPED || task.desired_status == status::STOPPED {
            return Ok(StopTaskResponse {
                task: TaskWire::from(&task),
            });
        }
        task.desired_status = status::STOPPED.to_string();
        task.stopping_at = Some(kecs_common::now_ms());
        task.stopped_reason = Some(
            req.reason
                .clone()
                .unwrap_or_else(|| "Task stopped by user".to_string()),
        );
        match store.update(task).await {
            Ok(updated) => {
                state.hub.publish(
                    "task_update",
                    Some("task"),
                    Some(&updated.id),
                    serde_json::json!({
                        "taskArn": updated.arn,
                        "desiredStatus": updated.desired_status,
                    }),
                );
                return Ok(StopTaskResponse {
                    task: TaskWire::from(&updated),
                });
            }
            Err(Error::Conflict(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(format!(
        "task {} is being mutated concurrently, retry",
        req.task
    )))
}

pub async fn describe_tasks(
    state: &AppState,
    req: DescribeTasksRequest,
) -> Result<DescribeTasksResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let mut tasks = Vec::new();
    let mut failures = Vec::new();
    for reference in req.tasks {
        match state.db.tasks().get(&cluster.arn, &reference).await {
            Ok(t) => tasks.push(TaskWire::from(&t)),
            Err(Error::NotFound { .. }) => failures.push(Failure::missing(reference)),
            Err(e) => return Err(e),
        }
    }
    Ok(DescribeTasksResponse { tasks, failures })
}

pub async fn list_tasks(
    state: &AppState,
    req: ListTasksRequest,
) -> Result<ListTasksResponse, Error> {
    let cluster = resolve_cluster(state, req.cluster.as_deref()).await?;
    let (tasks, next_token) = state
        .db
        .tasks()
        .list(
            &cluster.arn,
            TaskFilters {
                service_name: req.service_name,
                desired_status: req.desired_status,
                launch_type: req.launch_type,
                started_by: req.started_by,
                max_results: req.max_results,
                next_token: req.next_token,
            },
        )
        .await?;
    Ok(ListTasksResponse {
        task_arns: tasks.into_iter().map(|t| t.arn).collect(),
        next_token,
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
    }

    #[tokio::test]
    async fn run_and_stop() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        seed(&app).await;

        let (status, body) = call(
            &app,
            "RunTask",
            serde_json::json!({"taskDefinition": "web", "count": 2}),
        )
        .await;
        assert_eq!(status, http::StatusCode::OK);
        let tasks = body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0]["lastStatus"], "PROVISIONING");
        assert_eq!(tasks[0]["desiredStatus"], "RUNNING");
        assert_eq!(tasks[0]["containers"][0]["name"], "app");

        let task_arn = tasks[0]["taskArn"].as_str().unwrap().to_string();
        let (_, stopped) = call(
            &app,
            "StopTask",
            serde_json::json!({"task": task_arn, "reason": "test teardown"}),
        )
        .await;
        assert_eq!(stopped["task"]["desiredStatus"], "STOPPED");
        assert_eq!(stopped["task"]["stoppedReason"], "test teardown");
        // Stopping again is idempotent.
        let (_, again) = call(&app, "StopTask", serde_json::json!({"task": task_arn})).await;
        assert_eq!(again["task"]["desiredStatus"], "STOPPED");
    }

    #[tokio::test]
    async fn list_and_describe() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        seed(&app).await;
        call(
            &app,
            "RunTask",
            serde_json::json!({"taskDefinition": "web", "startedBy": "cli"}),
        )
        .await;

        let (_, listed) = call(&app, "ListTasks", serde_json::json!({"startedBy": "cli"})).await;
        let arns = listed["taskArns"].as_array().unwrap();
        assert_eq!(arns.len(), 1);

        let (_, described) = call(
            &app,
            "DescribeTasks",
            serde_json::json!({"tasks": [arns[0], "missing-task"]}),
        )
        .await;
        assert_eq!(described["tasks"].as_array().unwrap().len(), 1);
        assert_eq!(described["failures"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_task_against_missing_cluster_fails() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        let (status, body) = call(
            &app,
            "RunTask",
            serde_json::json!({"cluster": "ghost", "taskDefinition": "web"}),
        )
        .await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "ClusterNotFoundException");
    }
}
