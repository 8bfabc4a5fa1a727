//! Provider façade
//!
//! The entry points the orchestrator integration calls. Pods are translated
//! with [`crate::translate`] and submitted through a
//! [`ContainerGroupGateway`]; status reconciliation runs in a
//! [`PodTracker`] started by [`AciProvider::start_tracking`].

use crate::aci;
use crate::error::{ProviderError, Result};
use crate::exec;
use crate::gateway::{ContainerGroupGateway, LogOptions};
use crate::health::HealthRegistry;
use crate::models::{tags, UnitId};
use crate::node;
use crate::observability::{ProviderMetrics, StructuredLogger};
use crate::settings::ProviderSettings;
use crate::tracker::{
    ActiveUnitSource, PodTracker, StatusNotifier, StatusSource, TrackerConfig, TrackerHandle,
};
use crate::translate::{
    build_container_group, pod_from_group, pod_status_from_group, resource_references,
    validate_container_group, ReferencedResources, TranslationContext,
};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, PodStatus, Secret};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal size requested for exec sessions
pub const EXEC_TERMINAL_COLS: i32 = 60;
pub const EXEC_TERMINAL_ROWS: i32 = 120;

/// Orchestrator objects a pod references
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// `Ok(None)` when the secret does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
}

pub struct AciProvider {
    gateway: Arc<dyn ContainerGroupGateway>,
    lookup: Arc<dyn ResourceLookup>,
    settings: ProviderSettings,
    gpu_skus: Vec<String>,
    context: TranslationContext,
    tracker: OnceLock<TrackerHandle>,
    metrics: ProviderMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl AciProvider {
    pub fn new(
        gateway: Arc<dyn ContainerGroupGateway>,
        lookup: Arc<dyn ResourceLookup>,
        settings: ProviderSettings,
        gpu_skus: Vec<String>,
    ) -> Self {
        let context = settings.translation_context(gpu_skus.clone());
        let logger = StructuredLogger::new(settings.node_name.clone());

        Self {
            gateway,
            lookup,
            settings,
            gpu_skus,
            context,
            tracker: OnceLock::new(),
            metrics: ProviderMetrics::new(),
            logger,
            health: None,
        }
    }

    /// Health registry the tracker reports into once started
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Create the provider after discovering the region's GPU SKUs
    ///
    /// A failed capability lookup leaves the provider without GPU support
    /// rather than failing startup.
    pub async fn connect(
        gateway: Arc<dyn ContainerGroupGateway>,
        lookup: Arc<dyn ResourceLookup>,
        settings: ProviderSettings,
    ) -> Self {
        let gpu_skus = match gateway.list_capabilities(&settings.region).await {
            Ok(capabilities) => node::gpu_skus_from_capabilities(
                &capabilities,
                &settings.region,
                &settings.operating_system,
            ),
            Err(e) => {
                warn!(region = %settings.region, error = %e, "Failed to list capabilities, GPU pods will be rejected");
                Vec::new()
            }
        };
        info!(region = %settings.region, gpu_skus = ?gpu_skus, "Discovered GPU SKUs");

        Self::new(gateway, lookup, settings, gpu_skus)
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn gpu_skus(&self) -> &[String] {
        &self.gpu_skus
    }

    async fn resolve_resources(&self, pod: &Pod) -> Result<ReferencedResources> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let refs = resource_references(pod);
        let mut resources = ReferencedResources::default();

        for name in &refs.secrets {
            if let Some(secret) = self.lookup.get_secret(namespace, name).await? {
                resources.insert_secret(secret);
            }
        }
        for name in &refs.config_maps {
            if let Some(config_map) = self.lookup.get_config_map(namespace, name).await? {
                resources.insert_config_map(config_map);
            }
        }

        Ok(resources)
    }

    /// Translate and submit a pod
    ///
    /// Validation errors are returned before any backend call.
    pub async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let id = UnitId::from_pod(pod).ok_or_else(|| ProviderError::validation("pod has no name"))?;
        let resources = self.resolve_resources(pod).await?;

        let group = build_container_group(pod, &self.context, &resources).map_err(|e| {
            self.metrics.inc_translation_failures();
            warn!(pod = %id, error = %e, "Pod cannot be translated");
            e
        })?;

        let name = id.group_name();
        let result = self.gateway.create_group(&name, &group).await;
        self.metrics.inc_group_operation("create", result.is_ok());
        result.map_err(|e| ProviderError::from_gateway(&name, e))?;

        self.logger
            .log_unit_created(&id.namespace, &id.name, &name);
        Ok(())
    }

    /// No-op; container groups cannot be updated in place
    pub async fn update_pod(&self, pod: &Pod) -> Result<()> {
        debug!(pod = ?pod.metadata.name, "Ignoring pod update");
        Ok(())
    }

    /// Delete the pod's container group
    ///
    /// Returns `ProviderError::NotFound` when the group does not exist.
    /// Running containers are reported terminated through the tracker.
    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let id = UnitId::new(namespace, name);
        self.delete_group(&id).await?;

        if let Some(tracker) = self.tracker.get() {
            tracker.mark_deleted(id).await;
        }
        Ok(())
    }

    async fn delete_group(&self, id: &UnitId) -> Result<()> {
        let group = id.group_name();

        let result = self.gateway.delete_group(&group).await;
        self.metrics.inc_group_operation("delete", result.is_ok());
        result.map_err(|e| ProviderError::from_gateway(&group, e))?;

        self.logger.log_unit_deleted(&id.namespace, &id.name, &group);
        Ok(())
    }

    /// The group backing a pod on this node
    async fn fetch_group(&self, id: &UnitId) -> Result<aci::ContainerGroup> {
        let name = id.group_name();
        let group = self
            .gateway
            .get_group(&name)
            .await
            .map_err(|e| ProviderError::from_gateway(&name, e))?;

        if group.tag(tags::NODE_NAME) != Some(self.settings.node_name.as_str()) {
            return Err(ProviderError::NotFound(name));
        }
        Ok(group)
    }

    /// Reconstructed pod, `None` when its group does not exist
    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        match self.fetch_group(&UnitId::new(namespace, name)).await {
            Ok(group) => pod_from_group(&group, &self.settings.internal_ip).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>> {
        match self.fetch_group(&UnitId::new(namespace, name)).await {
            Ok(group) => pod_status_from_group(&group, &self.settings.internal_ip).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn node_groups(&self) -> Result<Vec<aci::ContainerGroup>> {
        let groups = self
            .gateway
            .list_groups()
            .await
            .map_err(|e| ProviderError::Backend(e.to_string()))?;

        Ok(groups
            .into_iter()
            .filter(|g| g.tag(tags::NODE_NAME) == Some(self.settings.node_name.as_str()))
            .collect())
    }

    /// Pods of every container group placed by this node
    ///
    /// Groups that cannot be translated are logged and skipped.
    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        let groups = self.node_groups().await?;
        let mut pods = Vec::with_capacity(groups.len());

        for group in &groups {
            match pod_from_group(group, &self.settings.internal_ip) {
                Ok(pod) => pods.push(pod),
                Err(e) => {
                    self.metrics.inc_translation_failures();
                    warn!(
                        group = group.name.as_deref().unwrap_or_default(),
                        id = group.id.as_deref().unwrap_or_default(),
                        error = %e,
                        "Skipping container group"
                    );
                }
            }
        }

        Ok(pods)
    }

    pub async fn container_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<String> {
        let id = UnitId::new(namespace, name);
        self.fetch_group(&id).await?;
        let group = id.group_name();

        self.gateway
            .container_logs(&group, container, options)
            .await
            .map_err(|e| ProviderError::from_gateway(&group, e))
    }

    /// Run a command in a container, relaying stdin and stdout until the
    /// session closes or `cancel` fires
    #[allow(clippy::too_many_arguments)]
    pub async fn run_in_container<R, W>(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        command: &[String],
        stdin: Option<R>,
        stdout: W,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let id = UnitId::new(namespace, name);
        self.fetch_group(&id).await?;
        let group = id.group_name();

        let request = aci::ExecRequest {
            command: command.join(" "),
            terminal_size: aci::TerminalSize {
                rows: EXEC_TERMINAL_ROWS,
                cols: EXEC_TERMINAL_COLS,
            },
        };
        let session = self
            .gateway
            .exec_command(&group, container, &request)
            .await
            .map_err(|e| ProviderError::from_gateway(&group, e))?;

        debug!(pod = %id, container = %container, "Starting exec session");
        exec::proxy(
            &session.web_socket_uri,
            &session.password,
            stdin,
            stdout,
            cancel,
        )
        .await
    }

    /// Fill in the node object registered for this provider
    pub fn configure_node(&self, node: &mut Node) {
        node::configure_node(node, &self.settings, &self.gpu_skus, Utc::now());
    }

    /// Start the status tracker
    ///
    /// Only one tracker may run per provider. The returned task ends when
    /// `cancel` fires.
    pub fn start_tracking(
        self: &Arc<Self>,
        notifier: Arc<dyn StatusNotifier>,
        active_units: Arc<dyn ActiveUnitSource>,
        mut config: TrackerConfig,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        config.node_name = self.settings.node_name.clone();
        let (mut tracker, handle) = PodTracker::new(self.clone(), active_units, notifier, config);
        if let Some(health) = &self.health {
            tracker = tracker.with_health(health.clone());
        }

        self.tracker
            .set(handle)
            .map_err(|_| ProviderError::configuration("status tracking already started"))?;

        Ok(tokio::spawn(tracker.run(cancel)))
    }
}

#[async_trait]
impl StatusSource for AciProvider {
    async fn fetch_status(&self, id: &UnitId) -> Result<PodStatus> {
        let group = self.fetch_group(id).await?;
        pod_status_from_group(&group, &self.settings.internal_ip)
    }

    async fn list_backend_units(&self) -> Result<Vec<UnitId>> {
        let groups = self.node_groups().await?;
        Ok(groups
            .iter()
            .filter(|g| validate_container_group(g).is_ok())
            .filter_map(|g| {
                Some(UnitId::new(
                    g.tag(tags::NAMESPACE)?,
                    g.tag(tags::POD_NAME)?,
                ))
            })
            .collect())
    }

    // called from the tracker task itself, so no command is sent back
    async fn cleanup_unit(&self, id: &UnitId) -> Result<()> {
        self.delete_group(id).await
    }
}
