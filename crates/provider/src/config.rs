//! Provider configuration
//!
//! Layered with the `config` crate: an optional file named by
//! `ACI_CONFIG_FILE`, then `ACI_*` environment variables. Diagnostics
//! credentials come from their own environment variables.

use anyhow::{Context, Result};
use provider_lib::settings::{
    load_diagnostics, CapacitySettings, DiagnosticsSources, ProviderSettings, SubnetSettings,
};
use provider_lib::{RestConfig, TrackerConfig};
use serde::Deserialize;
use std::time::Duration;

pub const CONFIG_FILE_ENV: &str = "ACI_CONFIG_FILE";

/// Raw configuration as read from file and environment
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Name of the virtual node
    pub node_name: String,
    /// Port for health and metrics
    pub api_port: u16,

    pub subscription_id: String,
    pub resource_group: String,
    pub region: String,
    /// Bearer token for the management API
    pub access_token: String,
    pub management_endpoint: String,
    pub request_timeout_secs: u64,

    pub cluster_name: String,
    pub operating_system: String,
    /// Address reported as the node's and every pod's host IP
    pub internal_ip: String,
    pub daemon_endpoint_port: i32,
    pub cluster_domain: String,

    pub subnet_id: Option<String>,
    pub subnet_name: Option<String>,
    pub kube_dns_ip: Option<String>,

    pub capacity: CapacitySettings,

    pub poll_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub not_found_grace_secs: u64,
    /// Interval of the pod sync and node heartbeat
    pub sync_interval_secs: u64,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            node_name: env_or("NODE_NAME", "virtual-kubelet"),
            api_port: 8080,
            subscription_id: String::new(),
            resource_group: String::new(),
            region: String::new(),
            access_token: String::new(),
            management_endpoint: "https://management.azure.com".to_string(),
            request_timeout_secs: 30,
            cluster_name: String::new(),
            operating_system: "Linux".to_string(),
            internal_ip: env_or("VKUBELET_POD_IP", ""),
            daemon_endpoint_port: 10250,
            cluster_domain: "cluster.local".to_string(),
            subnet_id: None,
            subnet_name: None,
            kube_dns_ip: None,
            capacity: CapacitySettings::default(),
            poll_interval_secs: 5,
            cleanup_interval_secs: 300,
            not_found_grace_secs: 60,
            sync_interval_secs: 10,
        }
    }
}

impl ProviderConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ACI")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("failed to read configuration")?;

        config
            .try_deserialize()
            .context("failed to parse configuration")
    }

    /// Validated provider settings, including the diagnostics sink
    pub fn provider_settings(&self, diagnostics: &DiagnosticsSources) -> Result<ProviderSettings> {
        let subnet = self.subnet_id.as_ref().filter(|id| !id.is_empty()).map(|id| SubnetSettings {
            id: id.clone(),
            name: self.subnet_name.clone(),
            kube_dns_ip: self.kube_dns_ip.clone().unwrap_or_default(),
        });

        let settings = ProviderSettings {
            resource_group: self.resource_group.clone(),
            region: self.region.clone(),
            node_name: self.node_name.clone(),
            cluster_name: self.cluster_name.clone(),
            operating_system: self.operating_system.clone(),
            internal_ip: self.internal_ip.clone(),
            daemon_endpoint_port: self.daemon_endpoint_port,
            cluster_domain: self.cluster_domain.clone(),
            subnet,
            diagnostics: load_diagnostics(diagnostics, &self.node_name)?,
            capacity: self.capacity.clone(),
        };

        Ok(settings.validate()?)
    }

    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            endpoint: self.management_endpoint.clone(),
            subscription_id: self.subscription_id.clone(),
            resource_group: self.resource_group.clone(),
            access_token: self.access_token.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..Default::default()
        }
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
            not_found_grace: Duration::from_secs(self.not_found_grace_secs),
            node_name: self.node_name.clone(),
            ..Default::default()
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}
