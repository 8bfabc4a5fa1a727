//! Node registration and pod sync
//!
//! The controller keeps the virtual node registered, submits pods bound to
//! it and deletes container groups of pods marked for deletion. Status
//! reporting is left to the provider's tracker.

use crate::kube_source::{orchestrator_error, KubeOrchestrator};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use provider_lib::translate::status::{PHASE_FAILED, PHASE_SUCCEEDED};
use provider_lib::{
    AciProvider, Component, HealthRegistry, ProviderError, Result, StatusNotifier, UnitId,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const REASON_PROVIDER_FAILED: &str = "ProviderFailed";

/// Orchestrator operations the sync loop needs
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Pods bound to this node
    async fn node_pods(&self) -> Result<Vec<Pod>>;

    /// Remove a pod object once its backend resources are gone
    async fn remove_pod(&self, id: &UnitId) -> Result<()>;
}

#[async_trait]
impl PodStore for KubeOrchestrator {
    async fn node_pods(&self) -> Result<Vec<Pod>> {
        KubeOrchestrator::node_pods(self).await
    }

    async fn remove_pod(&self, id: &UnitId) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client().clone(), &id.namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match pods.delete(&id.name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => match orchestrator_error(&id.to_string(), e) {
                ProviderError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}

/// Work found by one sync pass
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub create: Vec<Pod>,
    pub delete: Vec<UnitId>,
    /// Submitted pods that no longer exist in the orchestrator
    pub forget: Vec<UnitId>,
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some(PHASE_SUCCEEDED) | Some(PHASE_FAILED)
    )
}

/// Compare the node's pods with the set already submitted
pub fn plan_sync(pods: &[Pod], submitted: &HashSet<UnitId>) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut seen = HashSet::new();

    for pod in pods {
        let Some(id) = UnitId::from_pod(pod) else {
            continue;
        };
        seen.insert(id.clone());

        if pod.metadata.deletion_timestamp.is_some() {
            plan.delete.push(id);
        } else if !submitted.contains(&id) && !is_terminal(pod) {
            plan.create.push(pod.clone());
        }
    }

    plan.forget = submitted
        .iter()
        .filter(|id| !seen.contains(*id))
        .cloned()
        .collect();
    plan.forget.sort();
    plan
}

/// Status reported for a pod the provider refused
pub fn rejected_status(err: &ProviderError) -> PodStatus {
    PodStatus {
        phase: Some(PHASE_FAILED.to_string()),
        reason: Some(REASON_PROVIDER_FAILED.to_string()),
        message: Some(err.to_string()),
        ..Default::default()
    }
}

pub struct PodController {
    provider: Arc<AciProvider>,
    store: Arc<dyn PodStore>,
    notifier: Arc<dyn StatusNotifier>,
    health: HealthRegistry,
    interval: Duration,
    submitted: HashSet<UnitId>,
}

impl PodController {
    pub fn new(
        provider: Arc<AciProvider>,
        store: Arc<dyn PodStore>,
        notifier: Arc<dyn StatusNotifier>,
        health: HealthRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
            health,
            interval,
            submitted: HashSet::new(),
        }
    }

    /// Seed the submitted set with groups that already exist
    pub async fn recover(&mut self) -> Result<usize> {
        let pods = self.provider.list_pods().await?;
        self.submitted
            .extend(pods.iter().filter_map(UnitId::from_pod));
        info!(count = self.submitted.len(), "Recovered existing container groups");
        Ok(self.submitted.len())
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = self.recover().await {
            warn!(error = %e, "Failed to list existing container groups");
            self.health
                .set_degraded(Component::Gateway, e.to_string())
                .await;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Pod controller stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.sync_once().await;
                }
            }
        }
    }

    /// One pass over the node's pods
    pub async fn sync_once(&mut self) {
        let pods = match self.store.node_pods().await {
            Ok(pods) => {
                self.health.set_healthy(Component::Orchestrator).await;
                pods
            }
            Err(e) => {
                warn!(error = %e, "Failed to list node pods");
                self.health
                    .set_degraded(Component::Orchestrator, e.to_string())
                    .await;
                return;
            }
        };

        let plan = plan_sync(&pods, &self.submitted);
        let mut backend_error = None;

        for pod in &plan.create {
            if let Err(e) = self.create(pod).await {
                backend_error = Some(e);
            }
        }
        for id in &plan.delete {
            if let Err(e) = self.delete(id).await {
                backend_error = Some(e);
            }
        }
        for id in &plan.forget {
            debug!(pod = %id, "Pod left the node");
            self.submitted.remove(id);
        }

        match backend_error {
            Some(e) => {
                self.health
                    .set_degraded(Component::Gateway, e.to_string())
                    .await
            }
            None => self.health.set_healthy(Component::Gateway).await,
        }
    }

    async fn create(&mut self, pod: &Pod) -> Result<()> {
        let Some(id) = UnitId::from_pod(pod) else {
            return Ok(());
        };

        match self.provider.create_pod(pod).await {
            Ok(()) => {
                self.submitted.insert(id);
                Ok(())
            }
            Err(e @ ProviderError::Validation(_)) => {
                warn!(pod = %id, error = %e, "Pod rejected");
                if let Err(notify_err) = self.notifier.notify(&id, &rejected_status(&e)).await {
                    warn!(pod = %id, error = %notify_err, "Failed to report rejected pod");
                }
                self.submitted.insert(id);
                Ok(())
            }
            Err(e) => {
                error!(pod = %id, error = %e, "Failed to create container group");
                Err(e)
            }
        }
    }

    async fn delete(&mut self, id: &UnitId) -> Result<()> {
        match self.provider.delete_pod(&id.namespace, &id.name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(pod = %id, "Container group already gone"),
            Err(e) => {
                error!(pod = %id, error = %e, "Failed to delete container group");
                return Err(e);
            }
        }
        self.submitted.remove(id);

        if let Err(e) = self.store.remove_pod(id).await {
            warn!(pod = %id, error = %e, "Failed to remove pod object");
        }
        Ok(())
    }
}

/// Create or refresh the virtual node object
pub async fn register_node(client: &kube::Client, provider: &AciProvider) -> Result<()> {
    let name = provider.settings().node_name.clone();
    let nodes: Api<Node> = Api::all(client.clone());

    let mut node = Node {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(BTreeMap::from([
                ("type".to_string(), "virtual-kubelet".to_string()),
                ("kubernetes.io/role".to_string(), "agent".to_string()),
                ("kubernetes.io/hostname".to_string(), name.clone()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    };
    provider.configure_node(&mut node);

    let existing = nodes
        .get_opt(&name)
        .await
        .map_err(|e| orchestrator_error(&name, e))?;

    if existing.is_none() {
        nodes
            .create(&PostParams::default(), &node)
            .await
            .map_err(|e| orchestrator_error(&name, e))?;
        info!(node = %name, "Node registered");
    }

    patch_node_status(&nodes, &name, &node).await
}

/// Refresh conditions and capacity so the node stays Ready
pub async fn heartbeat(client: &kube::Client, provider: &AciProvider) -> Result<()> {
    let name = provider.settings().node_name.clone();
    let nodes: Api<Node> = Api::all(client.clone());

    let mut node = Node::default();
    provider.configure_node(&mut node);
    patch_node_status(&nodes, &name, &node).await
}

async fn patch_node_status(nodes: &Api<Node>, name: &str, node: &Node) -> Result<()> {
    let mut status = node.status.clone().unwrap_or_default();
    if let Some(conditions) = status.conditions.as_mut() {
        let now = Time(chrono::Utc::now());
        for condition in conditions.iter_mut() {
            condition.last_heartbeat_time = Some(now.clone());
        }
    }

    nodes
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .map_err(|e| orchestrator_error(name, e))?;
    debug!(node = %name, "Node status refreshed");
    Ok(())
}

/// Keep the node heartbeat going until cancelled
pub async fn run_heartbeat(
    client: kube::Client,
    provider: Arc<AciProvider>,
    health: HealthRegistry,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = heartbeat(&client, &provider).await {
                    warn!(error = %e, "Node heartbeat failed");
                    health.set_degraded(Component::Orchestrator, e.to_string()).await;
                }
            }
        }
    }
}
