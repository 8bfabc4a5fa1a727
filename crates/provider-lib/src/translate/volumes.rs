//! Pod volumes and the Windows service-account filter

use super::{secret_value, ReferencedResources};
use crate::aci;
use crate::error::{ProviderError, Result};
use crate::models::SERVICE_ACCOUNT_MOUNT_PATH;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{ConfigMap, KeyToPath, Pod, Secret, Volume};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// CSI driver name of Azure Files
pub const AZURE_FILE_DRIVER_NAME: &str = "file.csi.azure.com";

const AZURE_FILE_SHARE_NAME: &str = "shareName";
const AZURE_FILE_SECRET_NAME: &str = "secretName";
const AZURE_FILE_STORAGE_ACCOUNT_NAME: &str = "azurestorageaccountname";
const AZURE_FILE_STORAGE_ACCOUNT_KEY: &str = "azurestorageaccountkey";

/// Translate every volume declared on the pod
pub fn translate_volumes(pod: &Pod, resources: &ReferencedResources) -> Result<Vec<aci::Volume>> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(Vec::new());
    };

    let mut volumes = Vec::new();
    for volume in spec.volumes.iter().flatten() {
        if let Some(translated) = translate_volume(pod, volume, resources)? {
            volumes.push(translated);
        }
    }
    Ok(volumes)
}

fn translate_volume(
    pod: &Pod,
    volume: &Volume,
    resources: &ReferencedResources,
) -> Result<Option<aci::Volume>> {
    let name = volume.name.clone();

    if volume.empty_dir.is_some() {
        return Ok(Some(aci::Volume {
            name,
            empty_dir: Some(serde_json::json!({})),
            ..Default::default()
        }));
    }

    if let Some(source) = &volume.secret {
        let secret_name = source.secret_name.as_deref().unwrap_or_default();
        let Some(secret) = resources.secret(secret_name) else {
            return missing(secret_name, "secret", source.optional).map(|_| None);
        };
        let mut files = BTreeMap::new();
        project(secret_entries(secret), source.items.as_deref(), &mut files)?;
        return Ok(secret_volume(name, files));
    }

    if let Some(source) = &volume.config_map {
        let map_name = source.name.as_deref().unwrap_or_default();
        let Some(config_map) = resources.config_map(map_name) else {
            return missing(map_name, "config map", source.optional).map(|_| None);
        };
        let mut files = BTreeMap::new();
        project(config_map_entries(config_map), source.items.as_deref(), &mut files)?;
        return Ok(secret_volume(name, files));
    }

    if let Some(projected) = &volume.projected {
        let mut files = BTreeMap::new();

        for source in projected.sources.iter().flatten() {
            if let Some(projection) = &source.secret {
                let secret_name = projection.name.as_deref().unwrap_or_default();
                match resources.secret(secret_name) {
                    Some(secret) => {
                        project(secret_entries(secret), projection.items.as_deref(), &mut files)?
                    }
                    None => missing(secret_name, "secret", projection.optional)?,
                }
            }

            if let Some(projection) = &source.config_map {
                let map_name = projection.name.as_deref().unwrap_or_default();
                match resources.config_map(map_name) {
                    Some(config_map) => project(
                        config_map_entries(config_map),
                        projection.items.as_deref(),
                        &mut files,
                    )?,
                    None => missing(map_name, "config map", projection.optional)?,
                }
            }

            if let Some(downward) = &source.downward_api {
                for item in downward.items.iter().flatten() {
                    let Some(field) = &item.field_ref else {
                        return Err(ProviderError::validation(format!(
                            "volume {name}: only fieldRef downward API items are supported"
                        )));
                    };
                    let value = downward_field(pod, &field.field_path)?;
                    files.insert(item.path.clone(), STANDARD.encode(value));
                }
            }

            // service account tokens are issued by the orchestrator, not the backend
        }

        return Ok(secret_volume(name, files));
    }

    if let Some(source) = &volume.azure_file {
        let (account, key) = storage_account(&source.secret_name, resources)?;
        return Ok(Some(azure_file_volume(
            name,
            source.share_name.clone(),
            source.read_only,
            account,
            key,
        )));
    }

    if let Some(csi) = &volume.csi {
        if csi.driver != AZURE_FILE_DRIVER_NAME {
            return Err(ProviderError::validation(format!(
                "volume {name}: CSI driver {} is not supported",
                csi.driver
            )));
        }

        let attributes = csi.volume_attributes.clone().unwrap_or_default();
        let share_name = attributes.get(AZURE_FILE_SHARE_NAME).ok_or_else(|| {
            ProviderError::validation(format!(
                "volume {name}: {AZURE_FILE_SHARE_NAME} must be set for {AZURE_FILE_DRIVER_NAME}"
            ))
        })?;
        let secret_name = attributes.get(AZURE_FILE_SECRET_NAME).ok_or_else(|| {
            ProviderError::validation(format!(
                "volume {name}: {AZURE_FILE_SECRET_NAME} must be set for {AZURE_FILE_DRIVER_NAME}"
            ))
        })?;

        let (account, key) = storage_account(secret_name, resources)?;
        return Ok(Some(azure_file_volume(
            name,
            share_name.clone(),
            csi.read_only,
            account,
            key,
        )));
    }

    Err(ProviderError::validation(format!(
        "volume {name}: unsupported volume source"
    )))
}

fn missing(name: &str, kind: &str, optional: Option<bool>) -> Result<()> {
    if optional.unwrap_or(false) {
        Ok(())
    } else {
        Err(ProviderError::validation(format!(
            "{kind} {name:?} is required by the pod and does not exist"
        )))
    }
}

fn secret_volume(name: String, files: BTreeMap<String, String>) -> Option<aci::Volume> {
    if files.is_empty() {
        return None;
    }
    Some(aci::Volume {
        name,
        secret: Some(files),
        ..Default::default()
    })
}

fn azure_file_volume(
    name: String,
    share_name: String,
    read_only: Option<bool>,
    storage_account_name: String,
    storage_account_key: String,
) -> aci::Volume {
    aci::Volume {
        name,
        azure_file: Some(aci::AzureFileVolume {
            share_name,
            read_only,
            storage_account_name,
            storage_account_key: Some(storage_account_key),
        }),
        ..Default::default()
    }
}

fn storage_account(secret_name: &str, resources: &ReferencedResources) -> Result<(String, String)> {
    let secret = resources.secret(secret_name).ok_or_else(|| {
        ProviderError::validation(format!("azure file secret {secret_name:?} not found"))
    })?;

    let read = |key: &str| -> Result<String> {
        let raw = secret_value(secret, key).ok_or_else(|| {
            ProviderError::validation(format!("azure file secret {secret_name:?} has no {key}"))
        })?;
        String::from_utf8(raw).map_err(|_| {
            ProviderError::validation(format!("azure file secret {secret_name:?}: {key} is not UTF-8"))
        })
    };

    Ok((
        read(AZURE_FILE_STORAGE_ACCOUNT_NAME)?,
        read(AZURE_FILE_STORAGE_ACCOUNT_KEY)?,
    ))
}

fn secret_entries(secret: &Secret) -> BTreeMap<String, Vec<u8>> {
    let mut entries: BTreeMap<String, Vec<u8>> = secret
        .string_data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
        .collect();
    for (k, v) in secret.data.iter().flatten() {
        entries.insert(k.clone(), v.0.clone());
    }
    entries
}

fn config_map_entries(config_map: &ConfigMap) -> BTreeMap<String, Vec<u8>> {
    let mut entries: BTreeMap<String, Vec<u8>> = config_map
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), v.as_bytes().to_vec()))
        .collect();
    for (k, v) in config_map.binary_data.iter().flatten() {
        entries.insert(k.clone(), v.0.clone());
    }
    entries
}

/// Copy entries into `files`, base64-encoded, honoring an explicit item list
fn project(
    entries: BTreeMap<String, Vec<u8>>,
    items: Option<&[KeyToPath]>,
    files: &mut BTreeMap<String, String>,
) -> Result<()> {
    match items {
        Some(items) if !items.is_empty() => {
            for item in items {
                let data = entries.get(&item.key).ok_or_else(|| {
                    ProviderError::validation(format!("referenced key {:?} does not exist", item.key))
                })?;
                files.insert(item.path.clone(), STANDARD.encode(data));
            }
        }
        _ => {
            for (key, data) in entries {
                files.insert(key, STANDARD.encode(data));
            }
        }
    }
    Ok(())
}

fn downward_field(pod: &Pod, field_path: &str) -> Result<String> {
    let value = match field_path {
        "metadata.namespace" => pod.metadata.namespace.clone(),
        "metadata.name" => pod.metadata.name.clone(),
        "metadata.uid" => pod.metadata.uid.clone(),
        other => {
            return Err(ProviderError::validation(format!(
                "downward API field {other:?} is not supported"
            )))
        }
    };
    Ok(value.unwrap_or_default())
}

fn strip(mounts: &mut Vec<aci::VolumeMount>, stripped: &mut BTreeSet<String>) {
    mounts.retain(|mount| {
        if mount.mount_path.eq_ignore_ascii_case(SERVICE_ACCOUNT_MOUNT_PATH) {
            stripped.insert(mount.name.clone());
            false
        } else {
            true
        }
    });
}

/// Strip service-account mounts and drop the volumes they leave unmounted
///
/// Returns the names of the volumes removed from the group.
pub fn strip_service_account_volumes(props: &mut aci::ContainerGroupProperties) -> BTreeSet<String> {
    let mut stripped = BTreeSet::new();
    for container in props.containers.iter_mut() {
        strip(&mut container.properties.volume_mounts, &mut stripped);
    }
    for container in props.init_containers.iter_mut() {
        strip(&mut container.properties.volume_mounts, &mut stripped);
    }

    let still_mounted: BTreeSet<&str> = props
        .containers
        .iter()
        .flat_map(|c| c.properties.volume_mounts.iter())
        .chain(
            props
                .init_containers
                .iter()
                .flat_map(|c| c.properties.volume_mounts.iter()),
        )
        .map(|m| m.name.as_str())
        .collect();

    let removed: BTreeSet<String> = stripped
        .into_iter()
        .filter(|name| !still_mounted.contains(name.as_str()))
        .collect();

    if !removed.is_empty() {
        info!(volumes = ?removed, "Ignoring service account volumes on Windows");
        props.volumes.retain(|v| !removed.contains(&v.name));
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        AzureFileVolumeSource, CSIVolumeSource, ConfigMapProjection, ConfigMapVolumeSource,
        DownwardAPIProjection, DownwardAPIVolumeFile, EmptyDirVolumeSource, HostPathVolumeSource,
        ObjectFieldSelector, PodSpec, ProjectedVolumeSource, SecretVolumeSource,
        ServiceAccountTokenProjection, VolumeProjection,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn pod_with(volumes: Vec<Volume>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("prod".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn opaque_secret(name: &str, entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn config_map(name: &str, entries: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn mount(name: &str, path: &str) -> aci::VolumeMount {
        aci::VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            read_only: None,
        }
    }

    #[test]
    fn test_empty_dir() {
        let pod = pod_with(vec![Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }]);

        let volumes = translate_volumes(&pod, &ReferencedResources::default()).unwrap();
        assert_eq!(volumes.len(), 1);
        assert!(volumes[0].empty_dir.is_some());
    }

    #[test]
    fn test_secret_volume_is_base64_encoded() {
        let pod = pod_with(vec![Volume {
            name: "creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("db".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let resources =
            ReferencedResources::default().with_secret(opaque_secret("db", &[("password", "pw")]));

        let volumes = translate_volumes(&pod, &resources).unwrap();
        let files = volumes[0].secret.as_ref().unwrap();
        assert_eq!(files["password"], STANDARD.encode("pw"));
    }

    #[test]
    fn test_missing_required_secret_fails() {
        let pod = pod_with(vec![Volume {
            name: "creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some("db".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let err = translate_volumes(&pod, &ReferencedResources::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn test_missing_optional_config_map_is_skipped() {
        let pod = pod_with(vec![Volume {
            name: "settings".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some("app".to_string()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let volumes = translate_volumes(&pod, &ReferencedResources::default()).unwrap();
        assert!(volumes.is_empty());
    }

    #[test]
    fn test_config_map_items_rename_files() {
        let pod = pod_with(vec![Volume {
            name: "settings".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some("app".to_string()),
                items: Some(vec![KeyToPath {
                    key: "app.yaml".to_string(),
                    path: "config/app.yaml".to_string(),
                    mode: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let resources = ReferencedResources::default().with_config_map(config_map(
            "app",
            &[("app.yaml", "port: 80"), ("unused", "x")],
        ));

        let volumes = translate_volumes(&pod, &resources).unwrap();
        let files = volumes[0].secret.as_ref().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files["config/app.yaml"], STANDARD.encode("port: 80"));
    }

    #[test]
    fn test_projected_volume_merges_sources_and_skips_token() {
        let pod = pod_with(vec![Volume {
            name: "kube-api-access".to_string(),
            projected: Some(ProjectedVolumeSource {
                sources: Some(vec![
                    VolumeProjection {
                        service_account_token: Some(ServiceAccountTokenProjection {
                            path: "token".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    VolumeProjection {
                        config_map: Some(ConfigMapProjection {
                            name: Some("kube-root-ca.crt".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    VolumeProjection {
                        downward_api: Some(DownwardAPIProjection {
                            items: Some(vec![DownwardAPIVolumeFile {
                                path: "namespace".to_string(),
                                field_ref: Some(ObjectFieldSelector {
                                    field_path: "metadata.namespace".to_string(),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }]),
                        }),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let resources = ReferencedResources::default()
            .with_config_map(config_map("kube-root-ca.crt", &[("ca.crt", "PEM")]));

        let volumes = translate_volumes(&pod, &resources).unwrap();
        let files = volumes[0].secret.as_ref().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["ca.crt"], STANDARD.encode("PEM"));
        assert_eq!(files["namespace"], STANDARD.encode("prod"));
        assert!(!files.contains_key("token"));
    }

    #[test]
    fn test_azure_file_volume() {
        let pod = pod_with(vec![Volume {
            name: "share".to_string(),
            azure_file: Some(AzureFileVolumeSource {
                secret_name: "storage".to_string(),
                share_name: "data".to_string(),
                read_only: Some(true),
            }),
            ..Default::default()
        }]);
        let resources = ReferencedResources::default().with_secret(opaque_secret(
            "storage",
            &[
                (AZURE_FILE_STORAGE_ACCOUNT_NAME, "acct"),
                (AZURE_FILE_STORAGE_ACCOUNT_KEY, "key"),
            ],
        ));

        let volumes = translate_volumes(&pod, &resources).unwrap();
        let file = volumes[0].azure_file.as_ref().unwrap();
        assert_eq!(file.share_name, "data");
        assert_eq!(file.storage_account_name, "acct");
        assert_eq!(file.storage_account_key.as_deref(), Some("key"));
        assert_eq!(file.read_only, Some(true));
    }

    #[test]
    fn test_csi_azure_file_volume() {
        let pod = pod_with(vec![Volume {
            name: "share".to_string(),
            csi: Some(CSIVolumeSource {
                driver: AZURE_FILE_DRIVER_NAME.to_string(),
                volume_attributes: Some(BTreeMap::from([
                    (AZURE_FILE_SHARE_NAME.to_string(), "data".to_string()),
                    (AZURE_FILE_SECRET_NAME.to_string(), "storage".to_string()),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        let resources = ReferencedResources::default().with_secret(opaque_secret(
            "storage",
            &[
                (AZURE_FILE_STORAGE_ACCOUNT_NAME, "acct"),
                (AZURE_FILE_STORAGE_ACCOUNT_KEY, "key"),
            ],
        ));

        let volumes = translate_volumes(&pod, &resources).unwrap();
        assert_eq!(volumes[0].azure_file.as_ref().unwrap().share_name, "data");
    }

    #[test]
    fn test_unsupported_volume_source_fails() {
        let pod = pod_with(vec![Volume {
            name: "host".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: "/var/log".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        let err = translate_volumes(&pod, &ReferencedResources::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn test_strip_service_account_volumes() {
        let mut props = aci::ContainerGroupProperties {
            containers: vec![
                aci::Container {
                    name: "app".to_string(),
                    properties: aci::ContainerProperties {
                        volume_mounts: vec![
                            mount("token", SERVICE_ACCOUNT_MOUNT_PATH),
                            mount("data", "/data"),
                        ],
                        ..Default::default()
                    },
                },
                aci::Container {
                    name: "sidecar".to_string(),
                    properties: aci::ContainerProperties {
                        volume_mounts: vec![mount("token", SERVICE_ACCOUNT_MOUNT_PATH)],
                        ..Default::default()
                    },
                },
            ],
            volumes: vec![
                aci::Volume {
                    name: "token".to_string(),
                    ..Default::default()
                },
                aci::Volume {
                    name: "data".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let removed = strip_service_account_volumes(&mut props);
        assert_eq!(removed, BTreeSet::from(["token".to_string()]));
        assert_eq!(props.containers[0].properties.volume_mounts.len(), 1);
        assert!(props.containers[1].properties.volume_mounts.is_empty());
        let names: Vec<_> = props.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["data"]);
    }

    #[test]
    fn test_volume_still_mounted_elsewhere_is_kept() {
        let mut props = aci::ContainerGroupProperties {
            containers: vec![
                aci::Container {
                    name: "app".to_string(),
                    properties: aci::ContainerProperties {
                        volume_mounts: vec![mount("shared", SERVICE_ACCOUNT_MOUNT_PATH)],
                        ..Default::default()
                    },
                },
                aci::Container {
                    name: "reader".to_string(),
                    properties: aci::ContainerProperties {
                        volume_mounts: vec![mount("shared", "/etc/shared")],
                        ..Default::default()
                    },
                },
            ],
            volumes: vec![aci::Volume {
                name: "shared".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let removed = strip_service_account_volumes(&mut props);
        assert!(removed.is_empty());
        assert_eq!(props.volumes.len(), 1);
    }

    #[test]
    fn test_init_container_service_account_mounts_are_stripped() {
        let mut props = aci::ContainerGroupProperties {
            containers: vec![aci::Container {
                name: "app".to_string(),
                properties: aci::ContainerProperties::default(),
            }],
            init_containers: vec![aci::InitContainer {
                name: "setup".to_string(),
                properties: aci::InitContainerProperties {
                    volume_mounts: vec![
                        mount("token", SERVICE_ACCOUNT_MOUNT_PATH),
                        mount("scratch", "/scratch"),
                    ],
                    ..Default::default()
                },
            }],
            volumes: vec![
                aci::Volume {
                    name: "token".to_string(),
                    ..Default::default()
                },
                aci::Volume {
                    name: "scratch".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let removed = strip_service_account_volumes(&mut props);
        assert_eq!(removed, BTreeSet::from(["token".to_string()]));
        assert_eq!(props.init_containers[0].properties.volume_mounts.len(), 1);
        let names: Vec<_> = props.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["scratch"]);
    }
}
