use kecs_types::cluster::{Cluster, status};
use kecs_types::{Error, arn};

use super::models::*;
use super::resolve_cluster;
use crate::state::AppState;

/// Create a cluster row. The backing `k8s_cluster_name` is allocated here
/// and persisted; no Kubernetes resources are touched until an instance
/// start deploys into them. Re-creating an existing name returns the
/// stored cluster.
pub async fn create_cluster(
    state: &AppState,
    req: CreateClusterRequest,
) -> Result<ClusterResponse, Error> {
    let name = req.cluster_name.unwrap_or_else(|| "default".to_string());
    if name.is_empty() {
        return Err(Error::invalid("clusterName must not be empty"));
    }
    let now = kecs_common::now_ms();
    let cluster = Cluster {
        id: uuid::Uuid::new_v4().to_string(),
        arn: arn::cluster(&state.region, &state.account_id, &name),
        name: name.clone(),
        status: status::ACTIVE.to_string(),
        region: state.region.clone(),
        account_id: state.account_id.clone(),
        k8s_cluster_name: format!("kecs-{}", kecs_common::names::random_name(&[])),
        registered_container_instances_count: 0,
        running_tasks_count: 0,
        pending_tasks_count: 0,
        active_services_count: 0,
        localstack_state: None,
        settings: req.settings,
        tags: req.tags,
        created_at: now,
        updated_at: now,
    };
    let stored = match state.db.clusters().create(cluster).await {
        Ok(c) => c,
        Err(Error::AlreadyExists { .. }) => state.db.clusters().get(&name).await?,
        Err(e) => return Err(e),
    };
    tracing::info!(cluster = %stored.name, k8s = %stored.k8s_cluster_name, "cluster created");
    Ok(ClusterResponse {
        cluster: ClusterWire::from(&stored),
    })
}

pub async fn describe_clusters(
    state: &AppState,
    req: DescribeClustersRequest,
) -> Result<DescribeClustersResponse, Error> {
    let refs = if req.clusters.is_empty() {
        vec!["default".to_string()]
    } else {
        req.clusters
    };
    let mut clusters = Vec::new();
    let mut failures = Vec::new();
    for reference in refs {
        match state.db.clusters().get(&reference).await {
            Ok(c) => clusters.push(ClusterWire::from(&c)),
            Err(Error::NotFound { .. }) => failures.push(Failure::missing(reference)),
            Err(e) => return Err(e),
        }
    }
    Ok(DescribeClustersResponse { clusters, failures })
}

pub async fn list_clusters(
    state: &AppState,
    req: ListClustersRequest,
) -> Result<ListClustersResponse, Error> {
    let (clusters, next_token) = state
        .db
        .clusters()
        .list(req.max_results, req.next_token)
        .await?;
    Ok(ListClustersResponse {
        cluster_arns: clusters.into_iter().map(|c| c.arn).collect(),
        next_token,
    })
}

pub async fn delete_cluster(
    state: &AppState,
    req: DeleteClusterRequest,
) -> Result<ClusterResponse, Error> {
    let mut deleted = state.db.clusters().delete(&req.cluster).await?;
    deleted.status = status::INACTIVE.to_string();
    state.hub.publish(
        "cluster_update",
        Some("cluster"),
        Some(&deleted.name),
        serde_json::json!({"clusterArn": deleted.arn, "status": deleted.status}),
    );
    Ok(ClusterResponse {
        cluster: ClusterWire::from(&deleted),
    })
}

pub async fn update_cluster(
    state: &AppState,
    req: UpdateClusterRequest,
) -> Result<ClusterResponse, Error> {
    let mut cluster = resolve_cluster(state, Some(&req.cluster)).await?;
    if let Some(settings) = req.settings {
        cluster.settings = Some(settings);
    }
    cluster.updated_at = kecs_common::now_ms();
    let updated = state.db.clusters().update(cluster).await?;
    Ok(ClusterResponse {
        cluster: ClusterWire::from(&updated),
    })
}
