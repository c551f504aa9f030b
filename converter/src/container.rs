use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, HTTPGetAction, Probe, ResourceRequirements,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kecs_types::task_definition::{ContainerDefinition, HealthCheck, Volume};

use crate::ConvertError;

const DEFAULT_PROBE_PERIOD: i32 = 30;
const DEFAULT_PROBE_TIMEOUT: i32 = 5;
const DEFAULT_PROBE_FAILURES: i32 = 3;
const DEFAULT_LIVENESS_INITIAL_DELAY: i32 = 30;
/// Readiness reacts faster than liveness.
const DEFAULT_READINESS_INITIAL_DELAY: i32 = 10;

/// Map one container definition to a Kubernetes container. Host ports are
/// not placed in the container spec; the caller records them in
/// annotations. Mount
/// points referencing volumes the task definition never declared are
/// dropped with a warning.
pub fn convert_container(
    def: &ContainerDefinition,
    declared_volumes: &[Volume],
) -> Result<Container, ConvertError> {
    let name = def
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConvertError::InvalidContainerDefinition("missing name".to_string()))?;
    let image = def
        .image
        .as_deref()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| {
            ConvertError::InvalidContainerDefinition(format!("container {name} missing image"))
        })?;

    let env: Vec<EnvVar> = def
        .environment
        .iter()
        .map(|kv| EnvVar {
            name: kv.name.clone(),
            value: Some(kv.value.clone()),
            ..Default::default()
        })
        .collect();

    let ports: Vec<ContainerPort> = def
        .port_mappings
        .iter()
        .filter_map(|pm| {
            pm.container_port.map(|port| ContainerPort {
                container_port: port,
                protocol: pm.protocol.as_deref().map(|p| p.to_uppercase()),
                name: pm.name.clone(),
                ..Default::default()
            })
        })
        .collect();

    let mounts: Vec<VolumeMount> = def
        .mount_points
        .iter()
        .filter_map(|mp| {
            let source = mp.source_volume.as_deref()?;
            let path = mp.container_path.as_deref()?;
            let declared = declared_volumes
                .iter()
                .any(|v| v.name.as_deref() == Some(source));
            if !declared {
                tracing::warn!(
                    container = name,
                    volume = source,
                    "mount point references an undeclared volume, dropping"
                );
                return None;
            }
            Some(VolumeMount {
                name: source.to_string(),
                mount_path: path.to_string(),
                read_only: mp.read_only,
                ..Default::default()
            })
        })
        .collect();

    let (liveness, readiness) = match &def.health_check {
        Some(hc) => {
            let probe = build_probe(hc)?;
            let mut readiness_probe = probe.clone();
            readiness_probe.initial_delay_seconds = Some(DEFAULT_READINESS_INITIAL_DELAY);
            (Some(probe), Some(readiness_probe))
        }
        None => (None, None),
    };

    Ok(Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        // The source maps `command` onto the container's command and
        // `entryPoint` onto its args; callers observe and rely on the
        // swapped roles.
        command: non_empty(&def.command),
        args: non_empty(&def.entry_point),
        env: if env.is_empty() { None } else { Some(env) },
        ports: if ports.is_empty() { None } else { Some(ports) },
        volume_mounts: if mounts.is_empty() {
            None
        } else {
            Some(mounts)
        },
        resources: convert_resources(def),
        liveness_probe: liveness,
        readiness_probe: readiness,
        ..Default::default()
    })
}

fn non_empty(v: &[String]) -> Option<Vec<String>> {
    if v.is_empty() { None } else { Some(v.to_vec()) }
}

/// Source CPU units (1024 = 1 vCPU) become millicores; memory MiB becomes
/// a `Mi` quantity.
fn convert_resources(def: &ContainerDefinition) -> Option<ResourceRequirements> {
    let mut limits: BTreeMap<String, Quantity> = BTreeMap::new();
    let mut requests: BTreeMap<String, Quantity> = BTreeMap::new();
    if def.cpu > 0 {
        let millis = def.cpu * 1000 / 1024;
        requests.insert("cpu".to_string(), Quantity(format!("{millis}m")));
        limits.insert("cpu".to_string(), Quantity(format!("{millis}m")));
    }
    if let Some(memory) = def.memory {
        limits.insert("memory".to_string(), Quantity(format!("{memory}Mi")));
        requests.insert("memory".to_string(), Quantity(format!("{memory}Mi")));
    } else if let Some(reservation) = def.memory_reservation {
        requests.insert("memory".to_string(), Quantity(format!("{reservation}Mi")));
    }
    if limits.is_empty() && requests.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        limits: if limits.is_empty() {
            None
        } else {
            Some(limits)
        },
        requests: if requests.is_empty() {
            None
        } else {
            Some(requests)
        },
        ..Default::default()
    })
}

/// Translate a health-check command into a probe:
/// `CMD-SHELL <script>` wraps in `sh -c`, `CMD <argv...>` executes
/// directly, `HTTP <path> <port>` becomes an httpGet probe.
fn build_probe(hc: &HealthCheck) -> Result<Probe, ConvertError> {
    let mut probe = Probe {
        period_seconds: Some(hc.interval.unwrap_or(DEFAULT_PROBE_PERIOD)),
        timeout_seconds: Some(hc.timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT)),
        failure_threshold: Some(hc.retries.unwrap_or(DEFAULT_PROBE_FAILURES)),
        initial_delay_seconds: Some(hc.start_period.unwrap_or(DEFAULT_LIVENESS_INITIAL_DELAY)),
        success_threshold: Some(1),
        ..Default::default()
    };
    let mut parts = hc.command.iter();
    match parts.next().map(String::as_str) {
        Some("CMD-SHELL") => {
            let script = parts.cloned().collect::<Vec<_>>().join(" ");
            if script.is_empty() {
                return Err(ConvertError::InvalidContainerDefinition(
                    "CMD-SHELL health check has no script".to_string(),
                ));
            }
            probe.exec = Some(ExecAction {
                command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            });
        }
        Some("CMD") => {
            let argv: Vec<String> = parts.cloned().collect();
            if argv.is_empty() {
                return Err(ConvertError::InvalidContainerDefinition(
                    "CMD health check has no argv".to_string(),
                ));
            }
            probe.exec = Some(ExecAction {
                command: Some(argv),
            });
        }
        Some("HTTP") => {
            let path = parts.next().cloned().unwrap_or_else(|| "/".to_string());
            let port = parts
                .next()
                .and_then(|p| p.parse::<i32>().ok())
                .unwrap_or(80);
            probe.http_get = Some(HTTPGetAction {
                path: Some(path),
                port: IntOrString::Int(port),
                ..Default::default()
            });
        }
        other => {
            return Err(ConvertError::InvalidContainerDefinition(format!(
                "unsupported health check command {other:?}"
            )));
        }
    }
    Ok(probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kecs_types::task_definition::{KeyValuePair, MountPoint, PortMapping};

    fn base() -> ContainerDefinition {
        ContainerDefinition {
            name: Some("app".to_string()),
            image: Some("nginx:latest".to_string()),
            cpu: 1024,
            memory: Some(512),
            ..Default::default()
        }
    }

    #[test]
    fn missing_name_or_image_rejected() {
        let mut def = base();
        def.name = None;
        assert!(convert_container(&def, &[]).is_err());
        let mut def = base();
        def.image = Some(String::new());
        assert!(convert_container(&def, &[]).is_err());
    }

    #[test]
    fn cpu_units_become_millicores() {
        let container = convert_container(&base(), &[]).unwrap();
        let resources = container.resources.unwrap();
        let limits = resources.limits.unwrap();
        // 1024 units = 1 vCPU = 1000m.
        assert_eq!(limits["cpu"].0, "1000m");
        assert_eq!(limits["memory"].0, "512Mi");

        let mut def = base();
        def.cpu = 256;
        let container = convert_container(&def, &[]).unwrap();
        // floor(256 * 1000 / 1024) = 250m.
        assert_eq!(
            container.resources.unwrap().limits.unwrap()["cpu"].0,
            "250m"
        );
    }

    #[test]
    fn command_and_entry_point_swap_roles() {
        let mut def = base();
        def.command = vec!["serve".to_string(), "--port=8080".to_string()];
        def.entry_point = vec!["/bin/app".to_string()];
        let container = convert_container(&def, &[]).unwrap();
        assert_eq!(
            container.command,
            Some(vec!["serve".to_string(), "--port=8080".to_string()])
        );
        assert_eq!(container.args, Some(vec!["/bin/app".to_string()]));
    }

    #[test]
    fn env_and_ports_map_one_to_one() {
        let mut def = base();
        def.environment = vec![KeyValuePair {
            name: "LOG_LEVEL".to_string(),
            value: "debug".to_string(),
        }];
        def.port_mappings = vec![PortMapping {
            container_port: Some(8080),
            host_port: Some(30080),
            protocol: Some("tcp".to_string()),
            name: None,
        }];
        let container = convert_container(&def, &[]).unwrap();
        let env = container.env.unwrap();
        assert_eq!(env[0].name, "LOG_LEVEL");
        assert_eq!(env[0].value.as_deref(), Some("debug"));
        let ports = container.ports.unwrap();
        assert_eq!(ports[0].container_port, 8080);
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
        // Host port stays out of the container spec.
        assert!(ports[0].host_port.is_none());
    }

    #[test]
    fn undeclared_mounts_are_dropped() {
        let mut def = base();
        def.mount_points = vec![
            MountPoint {
                source_volume: Some("data".to_string()),
                container_path: Some("/data".to_string()),
                read_only: Some(true),
            },
            MountPoint {
                source_volume: Some("ghost".to_string()),
                container_path: Some("/ghost".to_string()),
                read_only: None,
            },
        ];
        let declared = vec![Volume {
            name: Some("data".to_string()),
            host: None,
        }];
        let container = convert_container(&def, &declared).unwrap();
        let mounts = container.volume_mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "data");
        assert_eq!(mounts[0].read_only, Some(true));
    }

    #[test]
    fn health_check_forms() {
        let mut def = base();
        def.health_check = Some(HealthCheck {
            command: vec!["CMD-SHELL".to_string(), "curl -f localhost".to_string()],
            interval: None,
            timeout: None,
            retries: None,
            start_period: None,
        });
        let container = convert_container(&def, &[]).unwrap();
        let liveness = container.liveness_probe.unwrap();
        assert_eq!(
            liveness.exec.unwrap().command.unwrap(),
            vec!["sh", "-c", "curl -f localhost"]
        );
        assert_eq!(liveness.period_seconds, Some(30));
        assert_eq!(liveness.timeout_seconds, Some(5));
        assert_eq!(liveness.failure_threshold, Some(3));
        assert_eq!(liveness.initial_delay_seconds, Some(30));
        assert_eq!(liveness.success_threshold, Some(1));
        let readiness = container.readiness_probe.unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(10));

        let mut def = base();
        def.health_check = Some(HealthCheck {
            command: vec!["CMD".to_string(), "true".to_string()],
            interval: Some(10),
            timeout: None,
            retries: Some(5),
            start_period: None,
        });
        let container = convert_container(&def, &[]).unwrap();
        let probe = container.liveness_probe.unwrap();
        assert_eq!(probe.exec.unwrap().command.unwrap(), vec!["true"]);
        assert_eq!(probe.period_seconds, Some(10));
        assert_eq!(probe.failure_threshold, Some(5));

        let mut def = base();
        def.health_check = Some(HealthCheck {
            command: vec!["HTTP".to_string(), "/health".to_string(), "8080".to_string()],
            interval: None,
            timeout: None,
            retries: None,
            start_period: None,
        });
        let container = convert_container(&def, &[]).unwrap();
        let http = container.liveness_probe.unwrap().http_get.unwrap();
        assert_eq!(http.path.as_deref(), Some("/health"));
        assert_eq!(http.port, IntOrString::Int(8080));
    }

    #[test]
    fn no_health_check_means_no_probes() {
        let container = convert_container(&base(), &[]).unwrap();
        assert!(container.liveness_probe.is_none());
        assert!(container.readiness_probe.is_none());
    }
}
