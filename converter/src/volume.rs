use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, HostPathVolumeSource, Volume as K8sVolume,
};
use kecs_types::task_definition::Volume;

/// Every declared volume is emitted, referenced or not. A host block with
/// a non-empty source path maps to hostPath; an empty or absent host block
/// maps to emptyDir.
pub fn convert_volumes(volumes: &[Volume]) -> Vec<K8sVolume> {
    volumes
        .iter()
        .filter_map(|volume| {
            let name = volume.name.as_deref()?;
            let mut out = K8sVolume {
                name: name.to_string(),
                ..Default::default()
            };
            match volume.host.as_ref().and_then(|h| h.source_path.as_deref()) {
                Some(path) if !path.is_empty() => {
                    out.host_path = Some(HostPathVolumeSource {
                        path: path.to_string(),
                        ..Default::default()
                    });
                }
                _ => {
                    out.empty_dir = Some(EmptyDirVolumeSource::default());
                }
            }
            Some(out)
        })
        .collect()
}
