use thiserror::Error;

/// Error taxonomy shared by the storage engine, the converter and the API
/// surface. Handlers translate these into wire-format `__type` kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("{entity} already exists: {name}")]
    AlreadyExists { entity: &'static str, name: String },

    #[error("invalid parameter: {0}")]
    Invalid(String),

    /// Optimistic version mismatch; the writer must re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cluster contains active services")]
    ClusterContainsServices,

    #[error("cluster contains running tasks")]
    ClusterContainsTasks,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),
}

impl Error {
    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            name: name.into(),
        }
    }

    pub fn already_exists(entity: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            entity,
            name: name.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    /// Wire-format error kind and whether it is the client's fault
    /// (HTTP 400) or ours (HTTP 500).
    pub fn wire_kind(&self) -> (&'static str, bool) {
        match self {
            Error::NotFound { entity, .. } => match *entity {
                entities::CLUSTER => ("ClusterNotFoundException", true),
                entities::SERVICE => ("ServiceNotFoundException", true),
                entities::TASK_DEFINITION => ("TaskDefinitionNotFoundException", true),
                entities::TASK_SET => ("TaskSetNotFoundException", true),
                _ => ("ClientException", true),
            },
            Error::AlreadyExists { .. } | Error::Invalid(_) => ("InvalidParameterException", true),
            Error::Conflict(_) => ("ClientException", true),
            Error::ClusterContainsServices => ("ClusterContainsServicesException", true),
            Error::ClusterContainsTasks => ("ClusterContainsTasksException", true),
            Error::Unavailable(_) | Error::Timeout(_) | Error::Io(_) | Error::Database(_) => {
                ("ServerException", false)
            }
        }
    }
}

/// Entity names used in `NotFound`/`AlreadyExists`; matching on these picks
/// the wire kind.
pub mod entities {
    pub const CLUSTER: &str = "cluster";
    pub const SERVICE: &str = "service";
    pub const TASK: &str = "task";
    pub const TASK_DEFINITION: &str = "task definition";
    pub const TASK_SET: &str = "task set";
    pub const CONTAINER_INSTANCE: &str = "container instance";
    pub const ATTRIBUTE: &str = "attribute";
    pub const LOAD_BALANCER: &str = "load balancer";
    pub const TARGET_GROUP: &str = "target group";
    pub const LISTENER: &str = "listener";
    pub const RULE: &str = "rule";
    pub const ACCOUNT_SETTING: &str = "account setting";
    pub const INSTANCE: &str = "instance";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_entity_kind() {
        let err = Error::not_found(entities::CLUSTER, "default");
        assert_eq!(err.wire_kind(), ("ClusterNotFoundException", true));
        let err = Error::not_found(entities::TASK_DEFINITION, "web:1");
        assert_eq!(err.wire_kind(), ("TaskDefinitionNotFoundException", true));
        let err = Error::not_found(entities::TASK, "abc");
        assert_eq!(err.wire_kind(), ("ClientException", true));
    }

    #[test]
    fn server_faults_are_500() {
        assert!(!Error::Database("locked".into()).wire_kind().1);
        assert!(!Error::Timeout("readiness".into()).wire_kind().1);
    }
}
