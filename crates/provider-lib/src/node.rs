//! Virtual node description
//!
//! The provider registers one node with effectively unlimited capacity; the
//! backend enforces real quotas on create.

use crate::aci;
use crate::settings::ProviderSettings;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeStatus,
    NodeSystemInfo,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;

pub const OS_LABEL: &str = "kubernetes.io/os";

const CONTAINER_GROUP_RESOURCE_TYPE: &str = "containerGroups";

/// GPU SKUs offered for the provider's region and OS, in listing order
pub fn gpu_skus_from_capabilities(capabilities: &[aci::Capability], region: &str, os_type: &str) -> Vec<String> {
    let mut skus: Vec<String> = Vec::new();

    for capability in capabilities {
        if !capability
            .resource_type
            .eq_ignore_ascii_case(CONTAINER_GROUP_RESOURCE_TYPE)
        {
            continue;
        }
        if !capability.os_type.eq_ignore_ascii_case(os_type) {
            continue;
        }
        if !capability.location.is_empty()
            && crate::settings::normalize_region(&capability.location) != region
        {
            continue;
        }
        let gpu = capability.gpu.trim();
        if gpu.is_empty() || gpu.eq_ignore_ascii_case("none") {
            continue;
        }
        if !skus.iter().any(|s| s.eq_ignore_ascii_case(gpu)) {
            skus.push(gpu.to_string());
        }
    }

    skus
}

/// Capacity advertised for the node
pub fn capacity(settings: &ProviderSettings, gpu_skus: &[String]) -> BTreeMap<String, Quantity> {
    let mut capacity = BTreeMap::from([
        ("cpu".to_string(), Quantity(settings.capacity.cpu.clone())),
        ("memory".to_string(), Quantity(settings.capacity.memory.clone())),
        ("pods".to_string(), Quantity(settings.capacity.pods.clone())),
    ]);
    if !gpu_skus.is_empty() {
        capacity.insert(
            crate::models::GPU_RESOURCE_NAME.to_string(),
            Quantity(settings.capacity.gpu.clone()),
        );
    }
    capacity
}

fn conditions(now: DateTime<Utc>) -> Vec<NodeCondition> {
    let condition = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(Time(now)),
        last_transition_time: Some(Time(now)),
    };

    vec![
        condition("Ready", "True", "KubeletReady", "kubelet is ready."),
        condition(
            "MemoryPressure",
            "False",
            "KubeletHasSufficientMemory",
            "kubelet has sufficient memory available",
        ),
        condition(
            "DiskPressure",
            "False",
            "KubeletHasNoDiskPressure",
            "kubelet has no disk pressure",
        ),
        condition(
            "PIDPressure",
            "False",
            "KubeletHasSufficientPID",
            "kubelet has sufficient PID available",
        ),
        condition(
            "NetworkUnavailable",
            "False",
            "RouteCreated",
            "RouteController created a route",
        ),
    ]
}

/// Fill in the node object the orchestrator registers for this provider
pub fn configure_node(node: &mut Node, settings: &ProviderSettings, gpu_skus: &[String], now: DateTime<Utc>) {
    let capacity = capacity(settings, gpu_skus);
    let os = settings.operating_system.to_lowercase();

    node.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(OS_LABEL.to_string(), os.clone());

    let status = node.status.get_or_insert_with(NodeStatus::default);
    status.capacity = Some(capacity.clone());
    status.allocatable = Some(capacity);
    status.conditions = Some(conditions(now));
    status.addresses = Some(vec![NodeAddress {
        type_: "InternalIP".to_string(),
        address: settings.internal_ip.clone(),
    }]);
    status.daemon_endpoints = Some(NodeDaemonEndpoints {
        kubelet_endpoint: Some(DaemonEndpoint {
            port: settings.daemon_endpoint_port,
        }),
    });
    let info = status.node_info.get_or_insert_with(NodeSystemInfo::default);
    info.operating_system = os;
    info.architecture = "amd64".to_string();
}
