//! Orchestrator side of the provider, backed by the cluster API

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use provider_lib::{
    ActiveUnit, ActiveUnitSource, ProviderError, ResourceLookup, Result, StatusNotifier, UnitId,
};
use serde_json::json;
use tracing::debug;

/// Map a cluster API failure, keeping 404 distinguishable
pub fn orchestrator_error(subject: &str, err: kube::Error) -> ProviderError {
    match err {
        kube::Error::Api(response) if response.code == 404 => {
            ProviderError::NotFound(subject.to_string())
        }
        other => ProviderError::Backend(format!("orchestrator: {other}")),
    }
}

/// Field selector matching the pods scheduled on a node
pub fn node_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name}")
}

/// Pods bound to the node, flagged when deleting or finished
pub fn active_units_from(pods: &[Pod]) -> Vec<ActiveUnit> {
    pods.iter().filter_map(ActiveUnit::from_pod).collect()
}

#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    node_name: String,
}

impl KubeOrchestrator {
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// All pods bound to this node
    pub async fn node_pods(&self) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&node_selector(&self.node_name));
        let list = pods
            .list(&params)
            .await
            .map_err(|e| orchestrator_error(&self.node_name, e))?;
        Ok(list.items)
    }
}

#[async_trait]
impl ActiveUnitSource for KubeOrchestrator {
    async fn active_units(&self) -> Result<Vec<ActiveUnit>> {
        let pods = self.node_pods().await?;
        Ok(active_units_from(&pods))
    }
}

#[async_trait]
impl ResourceLookup for KubeOrchestrator {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        secrets
            .get_opt(name)
            .await
            .map_err(|e| orchestrator_error(name, e))
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        config_maps
            .get_opt(name)
            .await
            .map_err(|e| orchestrator_error(name, e))
    }
}

#[async_trait]
impl StatusNotifier for KubeOrchestrator {
    async fn notify(&self, id: &UnitId, status: &PodStatus) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &id.namespace);
        let patch = Patch::Merge(json!({ "status": status }));
        pods.patch_status(&id.name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| orchestrator_error(&id.to_string(), e))?;

        debug!(pod = %id, phase = ?status.phase, "Pod status patched");
        Ok(())
    }
}
