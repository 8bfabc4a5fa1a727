//! Observability infrastructure for the provider
//!
//! Provides:
//! - Prometheus metrics (poll latency, tracked units, notifications, backend calls)
//! - Structured JSON logging of pod lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for poll cycle latency (in seconds)
const POLL_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<Option<ProviderMetricsInner>> = OnceLock::new();

struct ProviderMetricsInner {
    poll_cycle_seconds: Histogram,
    tracked_units: IntGauge,
    status_notifications: IntCounter,
    poll_errors: IntCounter,
    gone_missing: IntCounter,
    group_operations: IntCounterVec,
    translation_failures: IntCounter,
}

impl ProviderMetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            poll_cycle_seconds: register_histogram!(
                "aci_provider_poll_cycle_seconds",
                "Time spent polling every tracked pod once",
                POLL_LATENCY_BUCKETS.to_vec()
            )?,

            tracked_units: register_int_gauge!(
                "aci_provider_tracked_units",
                "Number of pods currently tracked"
            )?,

            status_notifications: register_int_counter!(
                "aci_provider_status_notifications_total",
                "Pod status changes delivered to the orchestrator"
            )?,

            poll_errors: register_int_counter!(
                "aci_provider_poll_errors_total",
                "Transient failures while fetching pod status"
            )?,

            gone_missing: register_int_counter!(
                "aci_provider_gone_missing_total",
                "Pods whose container group disappeared from the backend"
            )?,

            group_operations: register_int_counter_vec!(
                "aci_provider_group_operations_total",
                "Container group creates and deletes by outcome",
                &["operation", "outcome"]
            )?,

            translation_failures: register_int_counter!(
                "aci_provider_translation_failures_total",
                "Pods or snapshots that could not be translated"
            )?,
        })
    }
}

/// Provider metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics. If registration fails every method is a no-op.
#[derive(Clone)]
pub struct ProviderMetrics {
    _private: (),
}

impl Default for ProviderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match ProviderMetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register provider metrics");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&ProviderMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn observe_poll_cycle(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.poll_cycle_seconds.observe(duration_secs);
        }
    }

    pub fn set_tracked_units(&self, count: i64) {
        if let Some(m) = self.inner() {
            m.tracked_units.set(count);
        }
    }

    pub fn inc_status_notifications(&self) {
        if let Some(m) = self.inner() {
            m.status_notifications.inc();
        }
    }

    pub fn inc_poll_errors(&self) {
        if let Some(m) = self.inner() {
            m.poll_errors.inc();
        }
    }

    pub fn inc_gone_missing(&self) {
        if let Some(m) = self.inner() {
            m.gone_missing.inc();
        }
    }

    /// Count a create or delete; `outcome` is `success` or `error`
    pub fn inc_group_operation(&self, operation: &str, success: bool) {
        if let Some(m) = self.inner() {
            let outcome = if success { "success" } else { "error" };
            m.group_operations
                .with_label_values(&[operation, outcome])
                .inc();
        }
    }

    pub fn inc_translation_failures(&self) {
        if let Some(m) = self.inner() {
            m.translation_failures.inc();
        }
    }
}

/// Structured logger for pod lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_unit_created(&self, namespace: &str, pod_name: &str, group: &str) {
        info!(
            event = "unit_created",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            group = %group,
            "Container group created"
        );
    }

    pub fn log_unit_deleted(&self, namespace: &str, pod_name: &str, group: &str) {
        info!(
            event = "unit_deleted",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            group = %group,
            "Container group deleted"
        );
    }

    pub fn log_status_changed(&self, namespace: &str, pod_name: &str, phase: Option<&str>) {
        info!(
            event = "status_changed",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            phase = phase.unwrap_or("Unknown"),
            "Pod status changed"
        );
    }

    pub fn log_unit_gone_missing(&self, namespace: &str, pod_name: &str, uid: Option<&str>) {
        warn!(
            event = "unit_gone_missing",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            uid = uid.unwrap_or(""),
            "Container group disappeared from the backend"
        );
    }

    pub fn log_startup(&self, version: &str, region: &str, resource_group: &str) {
        info!(
            event = "provider_started",
            node = %self.node_name,
            provider_version = %version,
            region = %region,
            resource_group = %resource_group,
            "Container instance provider started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "provider_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Container instance provider shutting down"
        );
    }
}
