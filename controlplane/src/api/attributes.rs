use kecs_types::Error;
use kecs_types::arn;

use super::models::*;
use crate::state::AppState;

fn cluster_name(reference: &Option<String>) -> String {
    reference
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(arn::resource_name)
        .unwrap_or("default")
        .to_string()
}

pub async fn put_attributes(
    state: &AppState,
    req: PutAttributesRequest,
) -> Result<AttributesResponse, Error> {
    let cluster = cluster_name(&req.cluster);
    let attributes = req
        .attributes
        .into_iter()
        .map(|mut a| {
            a.cluster = cluster.clone();
            a
        })
        .collect();
    let stored = state.db.attributes().put(attributes).await?;
    Ok(AttributesResponse { attributes: stored })
}

pub async fn delete_attributes(
    state: &AppState,
    req: DeleteAttributesRequest,
) -> Result<AttributesResponse, Error> {
    let cluster = cluster_name(&req.cluster);
    let attributes: Vec<_> = req
        .attributes
        .into_iter()
        .map(|mut a| {
            a.cluster = cluster.clone();
            a
        })
        .collect();
    state.db.attributes().delete(attributes.clone()).await?;
    Ok(AttributesResponse { attributes })
}

pub async fn list_attributes(
    state: &AppState,
    req: ListAttributesRequest,
) -> Result<AttributesResponse, Error> {
    let cluster = cluster_name(&req.cluster);
    let attributes = state
        .db
        .attributes()
        .list(&cluster, req.target_type, req.attribute_name)
        .await?;
    Ok(AttributesResponse { attributes })
}
