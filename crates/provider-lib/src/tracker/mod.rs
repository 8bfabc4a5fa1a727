//! Status reconciliation
//!
//! The tracker periodically polls the backend for every pod the orchestrator
//! expects on this node and reports status changes back:
//! - one notification per observed change (fingerprint comparison)
//! - a single synthesized `Failed` status when a container group disappears
//! - periodic removal of backend groups the orchestrator no longer knows
//!
//! The tracker task is the only owner of its entries. Foreground callers
//! reach it through [`TrackerHandle`].

mod r#loop;

#[cfg(test)]
mod tests;

pub use r#loop::{
    fingerprint, PodTracker, PollOutcome, PollRecord, PollResults, TrackerBuilder, TrackerConfig,
    TrackerEntry, TrackerHandle,
};

use crate::error::Result;
use crate::models::{ActiveUnit, UnitId};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodStatus;

/// Backend view of tracked pods
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Current status of a pod
    ///
    /// Must return `ProviderError::NotFound` when the container group does
    /// not exist; any other error is treated as transient.
    async fn fetch_status(&self, id: &UnitId) -> Result<PodStatus>;

    /// Pods the backend currently hosts for this node
    async fn list_backend_units(&self) -> Result<Vec<UnitId>>;

    /// Remove a backend unit the orchestrator no longer expects
    async fn cleanup_unit(&self, id: &UnitId) -> Result<()>;
}

/// Orchestrator view of the pods assigned to this node
#[async_trait]
pub trait ActiveUnitSource: Send + Sync {
    async fn active_units(&self) -> Result<Vec<ActiveUnit>>;
}

/// Receiver of status changes
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    /// Deliver a new status; on error the change is retried next cycle
    async fn notify(&self, id: &UnitId, status: &PodStatus) -> Result<()>;
}
