//! Immutable provider settings
//!
//! Built once at startup and passed by reference. Construction enforces the
//! region gate: a missing resource group or region, or a region outside the
//! supported list, fails with `ProviderError::Configuration`.

use crate::aci;
use crate::error::{ProviderError, Result};
use crate::translate::{SubnetPlacement, TranslationContext};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Regions where container groups can be created
pub const SUPPORTED_REGIONS: &[&str] = &[
    "australiaeast",
    "australiasoutheast",
    "brazilsouth",
    "canadacentral",
    "canadaeast",
    "centralindia",
    "centralus",
    "centraluseuap",
    "eastasia",
    "eastus",
    "eastus2",
    "eastus2euap",
    "francecentral",
    "germanywestcentral",
    "japaneast",
    "japanwest",
    "jioindiawest",
    "koreacentral",
    "northcentralus",
    "northeurope",
    "norwayeast",
    "norwaywest",
    "southafricanorth",
    "southcentralus",
    "southindia",
    "southeastasia",
    "swedencentral",
    "swedensouth",
    "switzerlandnorth",
    "switzerlandwest",
    "uaenorth",
    "uksouth",
    "ukwest",
    "westcentralus",
    "westeurope",
    "westindia",
    "westus",
    "westus2",
    "westus3",
    "usgovvirginia",
    "usgovarizona",
];

pub const ENV_LOG_ANALYTICS_AUTH_LOCATION: &str = "LOG_ANALYTICS_AUTH_LOCATION";
pub const ENV_LOG_ANALYTICS_ID: &str = "LOG_ANALYTICS_ID";
pub const ENV_LOG_ANALYTICS_KEY: &str = "LOG_ANALYTICS_KEY";
pub const ENV_CLUSTER_RESOURCE_ID: &str = "CLUSTER_RESOURCE_ID";

/// Lower-case the region and remove spaces ("West US 2" -> "westus2")
pub fn normalize_region(region: &str) -> String {
    region.to_lowercase().replace(' ', "")
}

pub fn is_supported_region(region: &str) -> bool {
    let normalized = normalize_region(region);
    SUPPORTED_REGIONS.contains(&normalized.as_str())
}

/// Node capacity advertised to the orchestrator
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CapacitySettings {
    pub cpu: String,
    pub memory: String,
    pub pods: String,
    /// Advertised only when the region offers GPU SKUs
    pub gpu: String,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            cpu: "10000".to_string(),
            memory: "4Ti".to_string(),
            pods: "5000".to_string(),
            gpu: "100".to_string(),
        }
    }
}

/// Virtual network placement
#[derive(Debug, Clone, PartialEq)]
pub struct SubnetSettings {
    /// Full resource id of the delegated subnet
    pub id: String,
    pub name: Option<String>,
    /// Cluster DNS service address
    pub kube_dns_ip: String,
}

/// Inputs to the diagnostics layering
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSources {
    pub auth_location: Option<PathBuf>,
    pub workspace_id: Option<String>,
    pub workspace_key: Option<String>,
    pub cluster_resource_id: Option<String>,
}

impl DiagnosticsSources {
    /// Read the layering inputs from the process environment
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            auth_location: var(ENV_LOG_ANALYTICS_AUTH_LOCATION).map(PathBuf::from),
            workspace_id: var(ENV_LOG_ANALYTICS_ID),
            workspace_key: var(ENV_LOG_ANALYTICS_KEY),
            cluster_resource_id: var(ENV_CLUSTER_RESOURCE_ID),
        }
    }
}

/// Workspace credentials file
#[derive(Debug, Deserialize)]
struct WorkspaceFile {
    #[serde(rename = "workspaceID")]
    workspace_id: String,
    #[serde(rename = "workspaceKey")]
    workspace_key: String,
}

fn workspace(id: String, key: String) -> aci::Diagnostics {
    aci::Diagnostics {
        log_analytics: aci::LogAnalytics {
            workspace_id: id,
            workspace_key: key,
            log_type: None,
            metadata: BTreeMap::new(),
        },
    }
}

fn read_workspace_file(path: &Path) -> Result<aci::Diagnostics> {
    let raw = std::fs::read(path).map_err(|e| {
        ProviderError::configuration(format!("failed to read log analytics file {path:?}: {e}"))
    })?;
    let file: WorkspaceFile = serde_json::from_slice(&raw).map_err(|e| {
        ProviderError::configuration(format!("malformed log analytics file {path:?}: {e}"))
    })?;
    Ok(workspace(file.workspace_id, file.workspace_key))
}

/// Resolve the diagnostics sink
///
/// Layers, later ones winning: the credentials file, then an explicit
/// workspace id and key pair, then a cluster resource id which switches the
/// workspace to ContainerInsights and tags it with the cluster and node.
pub fn load_diagnostics(sources: &DiagnosticsSources, node_name: &str) -> Result<Option<aci::Diagnostics>> {
    let mut diagnostics = match &sources.auth_location {
        Some(path) => Some(read_workspace_file(path)?),
        None => None,
    };

    if let (Some(id), Some(key)) = (&sources.workspace_id, &sources.workspace_key) {
        diagnostics = Some(workspace(id.clone(), key.clone()));
    }

    if let (Some(cluster), Some(diagnostics)) = (&sources.cluster_resource_id, diagnostics.as_mut()) {
        diagnostics.log_analytics.log_type = Some(aci::LOG_TYPE_CONTAINER_INSIGHTS.to_string());
        diagnostics.log_analytics.metadata = BTreeMap::from([
            (aci::metadata::CLUSTER_RESOURCE_ID.to_string(), cluster.clone()),
            (aci::metadata::NODE_NAME.to_string(), node_name.to_string()),
        ]);
    }

    Ok(diagnostics)
}

/// Provider configuration, validated
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub resource_group: String,
    /// Normalized region
    pub region: String,
    pub node_name: String,
    pub cluster_name: String,
    /// "Linux" or "Windows"
    pub operating_system: String,
    /// Reported as the host IP of every pod
    pub internal_ip: String,
    pub daemon_endpoint_port: i32,
    pub cluster_domain: String,
    pub subnet: Option<SubnetSettings>,
    pub diagnostics: Option<aci::Diagnostics>,
    pub capacity: CapacitySettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            resource_group: String::new(),
            region: String::new(),
            node_name: "virtual-kubelet".to_string(),
            cluster_name: String::new(),
            operating_system: aci::OS_TYPE_LINUX.to_string(),
            internal_ip: String::new(),
            daemon_endpoint_port: 10250,
            cluster_domain: "cluster.local".to_string(),
            subnet: None,
            diagnostics: None,
            capacity: CapacitySettings::default(),
        }
    }
}

impl ProviderSettings {
    /// Apply the region gate and normalize fields
    pub fn validate(mut self) -> Result<Self> {
        if self.resource_group.trim().is_empty() {
            return Err(ProviderError::configuration(
                "resource group can not be empty, set ACI_RESOURCE_GROUP",
            ));
        }
        if self.region.trim().is_empty() {
            return Err(ProviderError::configuration(
                "region can not be empty, set ACI_REGION",
            ));
        }
        if !is_supported_region(&self.region) {
            return Err(ProviderError::configuration(format!(
                "region {} is invalid, supported regions are: {}",
                self.region,
                SUPPORTED_REGIONS.join(", ")
            )));
        }
        self.region = normalize_region(&self.region);

        self.operating_system = match self.operating_system.to_lowercase().as_str() {
            "linux" => aci::OS_TYPE_LINUX.to_string(),
            "windows" => aci::OS_TYPE_WINDOWS.to_string(),
            other => {
                return Err(ProviderError::configuration(format!(
                    "operating system {other:?} is not supported"
                )))
            }
        };

        if let Some(subnet) = &self.subnet {
            if subnet.id.is_empty() || subnet.kube_dns_ip.is_empty() {
                return Err(ProviderError::configuration(
                    "subnet placement requires both a subnet id and the cluster DNS address",
                ));
            }
        }

        info!(
            resource_group = %self.resource_group,
            region = %self.region,
            node = %self.node_name,
            os = %self.operating_system,
            diagnostics = self.diagnostics.is_some(),
            "Provider settings validated"
        );

        Ok(self)
    }

    /// Inputs for request translation, with the region's discovered GPU SKUs
    pub fn translation_context(&self, gpu_skus: Vec<String>) -> TranslationContext {
        TranslationContext {
            region: self.region.clone(),
            os_type: self.operating_system.clone(),
            node_name: self.node_name.clone(),
            cluster_name: self.cluster_name.clone(),
            gpu_skus,
            diagnostics: self.diagnostics.clone(),
            subnet: self.subnet.as_ref().map(|subnet| SubnetPlacement {
                subnet_id: subnet.id.clone(),
                subnet_name: subnet.name.clone(),
                dns_server: subnet.kube_dns_ip.clone(),
                cluster_domain: self.cluster_domain.clone(),
            }),
        }
    }
}
