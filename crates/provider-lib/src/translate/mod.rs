//! Translation engine
//!
//! Pure conversions between the orchestrator's pod model and the backend's
//! container group model:
//! - `build_container_group`: pod spec to create request
//! - `pod_status_from_group`: backend snapshot to pod status
//! - `pod_from_group`: backend snapshot to a reconstructed pod
//!
//! Nothing here performs I/O. Secrets and config maps a pod references are
//! resolved by the caller and handed in as `ReferencedResources`.

pub mod credentials;
pub mod probes;
pub mod request;
pub mod resources;
pub mod status;
pub mod validation;
pub mod volumes;


pub use request::build_container_group;
pub use status::{container_id, pod_from_group, pod_status_from_group};
pub use validation::validate_container_group;

use crate::aci;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use std::collections::{BTreeMap, BTreeSet};

/// Provider-wide inputs to request construction
#[derive(Debug, Clone, Default)]
pub struct TranslationContext {
    pub region: String,
    pub os_type: String,
    pub node_name: String,
    pub cluster_name: String,
    /// GPU SKUs available in the region, in preference order
    pub gpu_skus: Vec<String>,
    pub diagnostics: Option<aci::Diagnostics>,
    pub subnet: Option<SubnetPlacement>,
}

/// Virtual network placement for container groups
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetPlacement {
    pub subnet_id: String,
    pub subnet_name: Option<String>,
    /// Cluster DNS service address written as the only name server
    pub dns_server: String,
    pub cluster_domain: String,
}

/// Secrets and config maps a pod references, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ReferencedResources {
    secrets: BTreeMap<String, Secret>,
    config_maps: BTreeMap<String, ConfigMap>,
}

impl ReferencedResources {
    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.secrets.get(name)
    }

    pub fn config_map(&self, name: &str) -> Option<&ConfigMap> {
        self.config_maps.get(name)
    }

    pub fn insert_secret(&mut self, secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets.insert(name, secret);
    }

    pub fn insert_config_map(&mut self, config_map: ConfigMap) {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.config_maps.insert(name, config_map);
    }

    pub fn with_secret(mut self, secret: Secret) -> Self {
        self.insert_secret(secret);
        self
    }

    pub fn with_config_map(mut self, config_map: ConfigMap) -> Self {
        self.insert_config_map(config_map);
        self
    }
}

/// Names of the secrets and config maps a pod depends on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceReferences {
    pub secrets: BTreeSet<String>,
    pub config_maps: BTreeSet<String>,
}

/// Walk the pod spec and collect every secret and config map it names
pub fn resource_references(pod: &Pod) -> ResourceReferences {
    let mut refs = ResourceReferences::default();
    let Some(spec) = pod.spec.as_ref() else {
        return refs;
    };

    for secret in spec.image_pull_secrets.iter().flatten() {
        if let Some(name) = &secret.name {
            refs.secrets.insert(name.clone());
        }
    }

    let containers = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten());
    for container in containers {
        for env in container.env.iter().flatten() {
            let Some(source) = &env.value_from else {
                continue;
            };
            if let Some(name) = source.secret_key_ref.as_ref().and_then(|r| r.name.clone()) {
                refs.secrets.insert(name);
            }
            if let Some(name) = source.config_map_key_ref.as_ref().and_then(|r| r.name.clone()) {
                refs.config_maps.insert(name);
            }
        }
    }

    for volume in spec.volumes.iter().flatten() {
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.clone()) {
            refs.secrets.insert(name);
        }
        if let Some(name) = volume.config_map.as_ref().and_then(|c| c.name.clone()) {
            refs.config_maps.insert(name);
        }
        if let Some(file) = &volume.azure_file {
            refs.secrets.insert(file.secret_name.clone());
        }
        if let Some(name) = volume
            .csi
            .as_ref()
            .and_then(|csi| csi.volume_attributes.as_ref())
            .and_then(|attrs| attrs.get("secretName"))
        {
            refs.secrets.insert(name.clone());
        }
        let sources = volume
            .projected
            .as_ref()
            .and_then(|p| p.sources.as_ref())
            .into_iter()
            .flatten();
        for source in sources {
            if let Some(name) = source.secret.as_ref().and_then(|s| s.name.clone()) {
                refs.secrets.insert(name);
            }
            if let Some(name) = source.config_map.as_ref().and_then(|c| c.name.clone()) {
                refs.config_maps.insert(name);
            }
        }
    }

    refs
}

/// Raw bytes stored under `key`, from `data` or the write-only `stringData`
pub(crate) fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(value.0.clone());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.as_bytes().to_vec())
}
