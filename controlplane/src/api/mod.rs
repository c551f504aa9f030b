//! The JSON-over-HTTP front door.
//!
//! One POST route receives every operation; the `X-Amz-Target` header
//! (`<Service>.<Operation>`) selects the handler. Unknown operations get a
//! permissive `200 {}` so newer SDKs keep working against the emulator.

mod account_settings;
mod attributes;
mod clusters;
pub mod models;
mod services;
mod stubs;
mod task_definitions;
mod task_sets;
mod tasks;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use kecs_types::Error;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::state::AppState;

pub const CONTENT_TYPE_AMZ_JSON: &str = "application/x-amz-json-1.1";

pub fn router(state: AppState) -> Router {
    Router::new().route("/", post(dispatch)).with_state(state)
}

fn amz_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, CONTENT_TYPE_AMZ_JSON)],
        body.to_string(),
    )
        .into_response()
}

fn error_response(e: &Error) -> Response {
    let (kind, is_client) = e.wire_kind();
    let status = if is_client {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    amz_response(
        status,
        serde_json::json!({ "__type": kind, "message": e.to_string() }),
    )
}

async fn dispatch(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(target) = headers.get("x-amz-target").and_then(|v| v.to_str().ok()) else {
        return error_response(&Error::invalid("missing X-Amz-Target header"));
    };
    // The header must be `<Service>.<Operation>`.
    let Some((_, operation)) = target.split_once('.') else {
        return error_response(&Error::invalid(format!(
            "malformed X-Amz-Target '{target}'"
        )));
    };
    let operation = operation.to_string();

    let payload: serde_json::Value = if body.is_empty() {
        serde_json::json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                return error_response(&Error::invalid(format!("malformed request body: {e}")));
            }
        }
    };

    tracing::debug!(%operation, "dispatching");
    match route(&state, &operation, payload).await {
        Ok(value) => amz_response(StatusCode::OK, value),
        Err(e) => {
            tracing::warn!(%operation, error = %e, "operation failed");
            error_response(&e)
        }
    }
}

fn req<T: DeserializeOwned>(payload: serde_json::Value) -> Result<T, Error> {
    serde_json::from_value(payload).map_err(|e| Error::invalid(format!("invalid request: {e}")))
}

fn resp<T: Serialize>(value: T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(value).map_err(|e| Error::Database(format!("response encode: {e}")))
}

async fn route(
    state: &AppState,
    operation: &str,
    payload: serde_json::Value,
) -> Result<serde_json::Value, Error> {
    match operation {
        // Clusters
        "CreateCluster" => resp(clusters::create_cluster(state, req(payload)?).await?),
        "DescribeClusters" => resp(clusters::describe_clusters(state, req(payload)?).await?),
        "ListClusters" => resp(clusters::list_clusters(state, req(payload)?).await?),
        "DeleteCluster" => resp(clusters::delete_cluster(state, req(payload)?).await?),
        "UpdateCluster" => resp(clusters::update_cluster(state, req(payload)?).await?),

        // Task definitions
        "RegisterTaskDefinition" => {
            resp(task_definitions::register(state, req(payload)?).await?)
        }
        "DescribeTaskDefinition" => {
            resp(task_definitions::describe(state, req(payload)?).await?)
        }
        "ListTaskDefinitions" => resp(task_definitions::list(state, req(payload)?).await?),
        "ListTaskDefinitionFamilies" => {
            resp(task_definitions::list_families(state, req(payload)?).await?)
        }
        "DeregisterTaskDefinition" => {
            resp(task_definitions::deregister(state, req(payload)?).await?)
        }
        "DeleteTaskDefinitions" => {
            resp(task_definitions::delete_many(state, req(payload)?).await?)
        }

        // Services
        "CreateService" => resp(services::create_service(state, req(payload)?).await?),
        "UpdateService" => resp(services::update_service(state, req(payload)?).await?),
        "DeleteService" => resp(services::delete_service(state, req(payload)?).await?),
        "DescribeServices" => resp(services::describe_services(state, req(payload)?).await?),
        "ListServices" => resp(services::list_services(state, req(payload)?).await?),

        // Tasks
        "RunTask" => resp(tasks::run_task(state, req(payload)?).await?),
        "StopTask" => resp(tasks::stop_task(state, req(payload)?).await?),
        "DescribeTasks" => resp(tasks::describe_tasks(state, req(payload)?).await?),
        "ListTasks" => resp(tasks::list_tasks(state, req(payload)?).await?),

        // Task sets
        "CreateTaskSet" => resp(task_sets::create_task_set(state, req(payload)?).await?),
        "DeleteTaskSet" => resp(task_sets::delete_task_set(state, req(payload)?).await?),
        "DescribeTaskSets" => resp(task_sets::describe_task_sets(state, req(payload)?).await?),
        "UpdateServicePrimaryTaskSet" => {
            resp(task_sets::update_primary(state, req(payload)?).await?)
        }

        // Attributes
        "PutAttributes" => resp(attributes::put_attributes(state, req(payload)?).await?),
        "DeleteAttributes" => resp(attributes::delete_attributes(state, req(payload)?).await?),
        "ListAttributes" => resp(attributes::list_attributes(state, req(payload)?).await?),

        // Account settings
        "PutAccountSetting" => resp(account_settings::put(state, req(payload)?).await?),
        "ListAccountSettings" => resp(account_settings::list(state, req(payload)?).await?),
        "DeleteAccountSetting" => resp(account_settings::delete(state, req(payload)?).await?),

        // Compatibility stubs: accepted, minimally answered.
        "ExecuteCommand" | "DiscoverPollEndpoint" | "SubmitTaskStateChange"
        | "SubmitAttachmentStateChanges" | "GetTaskProtection" | "UpdateTaskProtection"
        | "StartTask" | "PutClusterCapacityProviders" | "UpdateClusterSettings" => {
            stubs::handle(state, operation, payload).await
        }

        other => {
            tracing::warn!(operation = other, "unknown operation, returning empty body");
            Ok(serde_json::json!({}))
        }
    }
}

/// Resolve the `cluster` request field (name, ARN or absent) to the stored
/// cluster; absent means the `default` cluster.
pub(crate) async fn resolve_cluster(
    state: &AppState,
    reference: Option<&str>,
) -> Result<kecs_types::cluster::Cluster, Error> {
    let reference = reference.filter(|c| !c.is_empty()).unwrap_or("default");
    state.db.clusters().get(reference).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hub::Hub;
    use axum::body::Body;
    use axum::http::Request;
    use http::header::CONTENT_TYPE;
    use kecs_storage::Database;
    use tower::ServiceExt;

    pub(crate) async fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("kecs.db")).await.unwrap();
        let hub = Hub::new(Vec::new());
        let state = AppState::new(
            db,
            hub,
            kecs_types::DEFAULT_REGION.to_string(),
            kecs_types::DEFAULT_ACCOUNT_ID.to_string(),
        );
        (dir, state)
    }

    pub(crate) async fn call(
        app: &Router,
        operation: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("x-amz-target", format!("AmazonEC2ContainerServiceV20141113.{operation}"))
            .header(CONTENT_TYPE, CONTENT_TYPE_AMZ_JSON)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn cluster_crud_round_trip() {
        let (_dir, state) = test_state().await;
        let app = router(state);

        let (status, body) =
            call(&app, "CreateCluster", serde_json::json!({"clusterName": "default"})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            body["cluster"]["clusterArn"]
                .as_str()
                .unwrap()
                .ends_with("/default")
        );
        assert_eq!(body["cluster"]["status"], "ACTIVE");

        let (status, body) = call(&app, "ListClusters", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clusterArns"].as_array().unwrap().len(), 1);

        let (status, body) =
            call(&app, "DeleteCluster", serde_json::json!({"cluster": "default"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cluster"]["status"], "INACTIVE");

        let (_, body) = call(&app, "ListClusters", serde_json::json!({})).await;
        assert!(body["clusterArns"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_operation_is_permissive() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        let (status, body) = call(&app, "FrobnicateWidgets", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({}));
    }

    #[tokio::test]
    async fn missing_target_header_is_rejected() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["__type"], "InvalidParameterException");
    }

    #[tokio::test]
    async fn malformed_target_header_is_rejected() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("x-amz-target", "NoDotHere")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn error_envelope_carries_kind() {
        let (_dir, state) = test_state().await;
        let app = router(state);
        let (status, body) = call(
            &app,
            "DescribeServices",
            serde_json::json!({"cluster": "ghost", "services": ["web"]}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "ClusterNotFoundException");
        assert!(body["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn deleting_cluster_with_services_fails() {
        let (_dir, state) = test_state().await;
        let app = router(state.clone());
        call(&app, "CreateCluster", serde_json::json!({"clusterName": "default"})).await;
        call(
            &app,
            "RegisterTaskDefinition",
            serde_json::json!({
                "family": "web",
                "containerDefinitions": [{"name": "app", "image": "nginx"}]
            }),
        )
        .await;
        let (status, _) = call(
            &app,
            "CreateService",
            serde_json::json!({"serviceName": "web", "taskDefinition": "web"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            call(&app, "DeleteCluster", serde_json::json!({"cluster": "default"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["__type"], "ClusterContainsServicesException");
    }
}
