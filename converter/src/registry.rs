/// Ids extracted from a service-discovery registry ARN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceDiscoveryIds {
    pub namespace_id: Option<String>,
    pub service_id: Option<String>,
}

/// Parse the resource part of a servicediscovery ARN. Both the long form
/// `namespace/ns-XXX/service/srv-YYY` and the bare `service/srv-YYY` form
/// appear in the wild; record whichever ids are present.
pub fn extract_service_discovery_ids(registry_arn: &str) -> ServiceDiscoveryIds {
    let resource = registry_arn.splitn(6, ':').nth(5).unwrap_or(registry_arn);
    let mut out = ServiceDiscoveryIds::default();
    let mut parts = resource.split('/');
    while let Some(part) = parts.next() {
        match part {
            "namespace" => out.namespace_id = parts.next().map(str::to_string),
            "service" => out.service_id = parts.next().map(str::to_string),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_form() {
        let ids = extract_service_discovery_ids(
            "arn:aws:servicediscovery:us-east-1:000000000000:namespace/ns-abc123/service/srv-xyz789",
        );
        assert_eq!(ids.namespace_id.as_deref(), Some("ns-abc123"));
        assert_eq!(ids.service_id.as_deref(), Some("srv-xyz789"));
    }

    #[test]
    fn service_only_form() {
        let ids = extract_service_discovery_ids(
            "arn:aws:servicediscovery:us-east-1:000000000000:service/srv-xyz789",
        );
        assert_eq!(ids.namespace_id, None);
        assert_eq!(ids.service_id.as_deref(), Some("srv-xyz789"));
    }

    #[test]
    fn garbage_yields_nothing() {
        let ids = extract_service_discovery_ids("not-an-arn");
        assert_eq!(ids, ServiceDiscoveryIds::default());
    }
}
