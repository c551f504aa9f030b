//! ARN construction and tolerant parsing.
//!
//! Canonical forms:
//! `arn:aws:ecs:<region>:<account>:cluster/<name>`
//! `arn:aws:ecs:<region>:<account>:task-definition/<family>:<rev>`
//! `arn:aws:ecs:<region>:<account>:service/<cluster>/<name>`
//! `arn:aws:ecs:<region>:<account>:task/<cluster>/<id>`

use crate::{Error, Result};

pub fn cluster(region: &str, account: &str, name: &str) -> String {
    format!("arn:aws:ecs:{region}:{account}:cluster/{name}")
}

pub fn task_definition(region: &str, account: &str, family: &str, revision: i64) -> String {
    format!("arn:aws:ecs:{region}:{account}:task-definition/{family}:{revision}")
}

pub fn service(region: &str, account: &str, cluster: &str, name: &str) -> String {
    format!("arn:aws:ecs:{region}:{account}:service/{cluster}/{name}")
}

pub fn task(region: &str, account: &str, cluster: &str, id: &str) -> String {
    format!("arn:aws:ecs:{region}:{account}:task/{cluster}/{id}")
}

pub fn task_set(region: &str, account: &str, cluster: &str, service: &str, id: &str) -> String {
    format!("arn:aws:ecs:{region}:{account}:task-set/{cluster}/{service}/{id}")
}

pub fn container_instance(region: &str, account: &str, cluster: &str, id: &str) -> String {
    format!("arn:aws:ecs:{region}:{account}:container-instance/{cluster}/{id}")
}

/// Last path segment of an ARN, or the input itself when it is already a
/// bare name. Callers accept both forms everywhere the wire does.
pub fn resource_name(arn_or_name: &str) -> &str {
    arn_or_name
        .rsplit('/')
        .next()
        .unwrap_or(arn_or_name)
}

/// Split a `family[:revision]` reference. `"web:3"` -> `("web", Some(3))`,
/// `"web"` -> `("web", None)`. Accepts a full task-definition ARN too.
pub fn split_family_revision(reference: &str) -> Result<(String, Option<i64>)> {
    let name = resource_name(reference);
    match name.rsplit_once(':') {
        Some((family, rev)) => {
            let revision = rev
                .parse::<i64>()
                .map_err(|_| Error::invalid(format!("invalid revision in '{reference}'")))?;
            if family.is_empty() {
                return Err(Error::invalid(format!(
                    "invalid task definition reference '{reference}'"
                )));
            }
            Ok((family.to_string(), Some(revision)))
        }
        None => Ok((name.to_string(), None)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account: String,
    pub resource: String,
}

/// Parse an ARN. Tolerant of empty region/account segments, which appear
/// in internal identifiers.
pub fn parse(arn: &str) -> Result<ParsedArn> {
    let mut parts = arn.splitn(6, ':');
    let (Some("arn"), Some(partition), Some(service), Some(region), Some(account), Some(resource)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(Error::invalid(format!("malformed ARN '{arn}'")));
    };
    Ok(ParsedArn {
        partition: partition.to_string(),
        service: service.to_string(),
        region: region.to_string(),
        account: account.to_string(),
        resource: resource.to_string(),
    })
}
