//! Shared domain types for the kecs control plane.
//!
//! Entities here are the storage layer's row types and the converter's
//! inputs. Wire request/response shapes live with the API dispatcher;
//! the JSON blob types embedded in entities (container definitions,
//! network configuration, ...) are shared with the wire and therefore
//! serialize camelCase.

pub mod arn;
pub mod attribute;
pub mod cluster;
pub mod container_instance;
pub mod elbv2;
pub mod error;
pub mod logs;
pub mod service;
pub mod settings;
pub mod task;
pub mod task_definition;
pub mod task_set;

pub use error::Error;

/// Region echoed on every ARN and response unless configured otherwise.
pub const DEFAULT_REGION: &str = "us-east-1";
/// Synthetic account id used for all locally issued ARNs.
pub const DEFAULT_ACCOUNT_ID: &str = "000000000000";

pub type Result<T> = std::result::Result<T, Error>;
