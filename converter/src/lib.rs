//! Pure translation from domain entities to Kubernetes object trees.
//!
//! Every function here is deterministic and performs no I/O; the caller
//! owns applying the produced objects to a cluster.

use thiserror::Error;

mod container;
mod registry;
mod volume;
mod workload;

pub use container::convert_container;
pub use registry::{ServiceDiscoveryIds, extract_service_discovery_ids};
pub use volume::convert_volumes;
pub use workload::{
    deployment_for_service, deployment_for_task_set, endpoints_for_task_set,
    kubernetes_service_for_service, pod_for_task, pod_name_for_task,
};

pub const LABEL_APP: &str = "app";
pub const LABEL_SERVICE: &str = "kecs.dev/service";
pub const LABEL_CLUSTER: &str = "kecs.dev/cluster";
pub const LABEL_MANAGED_BY: &str = "kecs.dev/managed-by";
pub const LABEL_TASK_SET: &str = "kecs.dev/task-set-id";
pub const MANAGED_BY: &str = "kecs";

pub const ANNOTATION_SERVICE_ARN: &str = "kecs.dev/service-arn";
pub const ANNOTATION_TASK_SET_ARN: &str = "kecs.dev/task-set-arn";
pub const ANNOTATION_TASK_ARN: &str = "kecs.dev/task-arn";
pub const ANNOTATION_TASK_DEFINITION_ARN: &str = "kecs.dev/task-definition-arn";
pub const ANNOTATION_SCHEDULING_STRATEGY: &str = "kecs.dev/scheduling-strategy";
pub const ANNOTATION_NETWORK_CONFIGURATION: &str = "kecs.dev/network-configuration";
/// Prefix for recorded host ports: `kecs.dev/host-port.<container>.<port>`.
pub const ANNOTATION_HOST_PORT_PREFIX: &str = "kecs.dev/host-port";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid container definition: {0}")]
    InvalidContainerDefinition(String),

    #[error("invalid network mode: {0}")]
    InvalidNetworkMode(String),
}

impl From<ConvertError> for kecs_types::Error {
    fn from(e: ConvertError) -> Self {
        kecs_types::Error::Invalid(e.to_string())
    }
}
