//! Core data models shared by the translation engine, tracker and provider

use crate::translate::status::{PHASE_FAILED, PHASE_SUCCEEDED};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Container group tags written on create and read back on every snapshot
pub mod tags {
    pub const POD_NAME: &str = "PodName";
    pub const NAMESPACE: &str = "Namespace";
    pub const NODE_NAME: &str = "NodeName";
    pub const CLUSTER_NAME: &str = "ClusterName";
    pub const UID: &str = "UID";
    pub const CREATION_TIMESTAMP: &str = "CreationTimestamp";
}

/// Pod annotations understood by the provider
pub mod annotations {
    /// Requested GPU SKU, matched case-insensitively against the region's SKUs
    pub const GPU_TYPE: &str = "virtual-kubelet.io/gpu-type";
    /// DNS name label attached to the public IP
    pub const DNS_NAME_LABEL: &str = "virtualkubelet.io/dnsnamelabel";
}

/// Resource name of GPU limits
pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Mount path of the orchestrator's service account volume
pub const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Identifies a pod within the managed scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub namespace: String,
    pub name: String,
}

impl UnitId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identifier of a pod, if it carries both namespace and name
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.as_deref()?;
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        Some(Self::new(namespace, name))
    }

    /// Backend container group name for this pod
    pub fn group_name(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A pod the orchestrator currently expects to exist on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUnit {
    pub id: UnitId,
    /// Orchestrator-assigned uid; distinguishes re-created pods with the same name
    pub uid: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Marked for deletion; its container group is being torn down
    pub deleting: bool,
    /// Pod phase is already Succeeded or Failed
    pub terminal: bool,
}

impl ActiveUnit {
    pub fn new(id: UnitId) -> Self {
        Self {
            id,
            uid: None,
            created_at: None,
            deleting: false,
            terminal: false,
        }
    }

    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let id = UnitId::from_pod(pod)?;
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        Some(Self {
            id,
            uid: pod.metadata.uid.clone(),
            created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
            deleting: pod.metadata.deletion_timestamp.is_some(),
            terminal: matches!(phase, Some(PHASE_SUCCEEDED) | Some(PHASE_FAILED)),
        })
    }
}
