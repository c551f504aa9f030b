use kecs_types::task_definition::{TaskDefinition, network_mode};
use kecs_types::{Error, arn};

use super::models::*;
use crate::state::AppState;

/// Register a new revision. Note the container `command`/`entryPoint`
/// fields keep their swapped meaning all the way into the pod spec; see
/// the converter for the mapping callers observe.
pub async fn register(
    state: &AppState,
    req: RegisterTaskDefinitionRequest,
) -> Result<TaskDefinitionResponse, Error> {
    if req.family.is_empty() {
        return Err(Error::invalid("family must not be empty"));
    }
    if req.container_definitions.is_empty() {
        return Err(Error::invalid("containerDefinitions must not be empty"));
    }
    for def in &req.container_definitions {
        if def.name.as_deref().unwrap_or("").is_empty() {
            return Err(Error::invalid("container definition missing name"));
        }
        if def.image.as_deref().unwrap_or("").is_empty() {
            return Err(Error::invalid("container definition missing image"));
        }
    }

    let input = TaskDefinition {
        id: uuid::Uuid::new_v4().to_string(),
        arn: String::new(),
        family: req.family,
        revision: 0,
        network_mode: req
            .network_mode
            .unwrap_or_else(|| network_mode::AWSVPC.to_string()),
        container_definitions: req.container_definitions,
        volumes: req.volumes,
        cpu: req.cpu,
        memory: req.memory,
        task_role_arn: req.task_role_arn,
        execution_role_arn: req.execution_role_arn,
        requires_compatibilities: req.requires_compatibilities,
        status: String::new(),
        registered_at: kecs_common::now_ms(),
        deregistered_at: None,
    };
    let stored = state
        .db
        .task_definitions()
        .register(input, &state.region, &state.account_id)
        .await?;
    tracing::info!(family = %stored.family, revision = stored.revision, "task definition registered");
    Ok(TaskDefinitionResponse {
        task_definition: TaskDefinitionWire::from(&stored),
    })
}

pub async fn describe(
    state: &AppState,
    req: DescribeTaskDefinitionRequest,
) -> Result<TaskDefinitionResponse, Error> {
    let td = state
        .db
        .task_definitions()
        .resolve(&req.task_definition)
        .await?;
    Ok(TaskDefinitionResponse {
        task_definition: TaskDefinitionWire::from(&td),
    })
}

pub async fn list(
    state: &AppState,
    req: ListTaskDefinitionsRequest,
) -> Result<ListTaskDefinitionsResponse, Error> {
    let family = req.family_prefix.map(|p| format!("{p}%"));
    let (task_definition_arns, next_token) = state
        .db
        .task_definitions()
        .list_revisions(family, req.status, req.max_results, req.next_token)
        .await?;
    Ok(ListTaskDefinitionsResponse {
        task_definition_arns,
        next_token,
    })
}

pub async fn list_families(
    state: &AppState,
    req: ListTaskDefinitionFamiliesRequest,
) -> Result<ListTaskDefinitionFamiliesResponse, Error> {
    let (families, next_token) = state
        .db
        .task_definitions()
        .list_families(req.family_prefix, req.status, req.max_results, req.next_token)
        .await?;
    Ok(ListTaskDefinitionFamiliesResponse {
        families,
        next_token,
    })
}

pub async fn deregister(
    state: &AppState,
    req: DeregisterTaskDefinitionRequest,
) -> Result<TaskDefinitionResponse, Error> {
    let (family, revision) = arn::split_family_revision(&req.task_definition)?;
    let Some(revision) = revision else {
        return Err(Error::invalid(
            "taskDefinition must include a revision (family:revision)",
        ));
    };
    let td = state
        .db
        .task_definitions()
        .deregister(&family, revision)
        .await?;
    Ok(TaskDefinitionResponse {
        task_definition: TaskDefinitionWire::from(&td),
    })
}

pub async fn delete_many(
    state: &AppState,
    req: DeleteTaskDefinitionsRequest,
) -> Result<DeleteTaskDefinitionsResponse, Error> {
    let mut deleted = Vec::new();
    let mut failures = Vec::new();
    for reference in req.task_definitions {
        let parsed = arn::split_family_revision(&reference);
        match parsed {
            Ok((family, Some(revision))) => {
                match state.db.task_definitions().delete(&family, revision).await {
                    Ok(td) => deleted.push(TaskDefinitionWire::from(&td)),
                    Err(Error::NotFound { .. }) => failures.push(Failure::missing(reference)),
                    Err(e) => {
                        failures.push(Failure {
                            arn: reference,
                            reason: "INVALID".to_string(),
                            detail: Some(e.to_string()),
                        });
                    }
                }
            }
            _ => failures.push(Failure {
                arn: reference,
                reason: "INVALID".to_string(),
                detail: Some("expected family:revision".to_string()),
            }),
        }
    }
    Ok(DeleteTaskDefinitionsResponse {
        task_definitions: deleted,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{call, test_state};
    use crate::api::router;

    fn register_body(family: &str) -> serde_json::Value {
        serde_json::json!({
            "family": family,
            "containerDefinitions": [
                {"name": "app", "image": "nginx:latest", "cpu": 256, "memory": 512}
            ]
        })
    }

    #[tokio::test]
    async fn versioning_scenario() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        let (_, first) = call(&app, "RegisterTaskDefinition", register_body("web")).await;
        let (_, second) = call(&app, "RegisterTaskDefinition", register_body("web")).await;
        assert_eq!(first["taskDefinition"]["revision"], 1);
        assert_eq!(second["taskDefinition"]["revision"], 2);

        // Bare family resolves to the latest revision.
        let (_, latest) = call(
            &app,
            "DescribeTaskDefinition",
            serde_json::json!({"taskDefinition": "web"}),
        )
        .await;
        assert_eq!(latest["taskDefinition"]["revision"], 2);

        // Pinned revision resolves exactly.
        let (_, pinned) = call(
            &app,
            "DescribeTaskDefinition",
            serde_json::json!({"taskDefinition": "web:1"}),
        )
        .await;
        assert_eq!(pinned["taskDefinition"]["revision"], 1);

        // Deregistering flips status and drops it from ACTIVE listings.
        let (_, deregistered) = call(
            &app,
            "DeregisterTaskDefinition",
            serde_json::json!({"taskDefinition": "web:1"}),
        )
        .await;
        assert_eq!(deregistered["taskDefinition"]["status"], "INACTIVE");

        let (_, listed) = call(
            &app,
            "ListTaskDefinitions",
            serde_json::json!({"status": "ACTIVE"}),
        )
        .await;
        let arns: Vec<&str> = listed["taskDefinitionArns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(arns.len(), 1);
        assert!(arns[0].ends_with("web:2"));
    }

    #[tokio::test]
    async fn missing_image_rejected() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        let (status, body) = call(
            &app,
            "RegisterTaskDefinition",
            serde_json::json!({
                "family": "web",
                "containerDefinitions": [{"name": "app"}]
            }),
        )
        .await;
        assert_eq!(status, http::StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "InvalidParameterException");
    }
}
