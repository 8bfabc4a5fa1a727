//! Tracker loop
//!
//! Polls every tracked pod on a fixed interval, serially and in id order.
//! There is no backoff; a failed fetch is simply retried on the next cycle.

use super::{ActiveUnitSource, StatusNotifier, StatusSource};
use crate::error::{ProviderError, Result};
use crate::health::{Component, HealthRegistry};
use crate::models::{ActiveUnit, UnitId};
use crate::observability::{ProviderMetrics, StructuredLogger};
use crate::translate::status::{mark_pod_deleted, terminate_running_containers};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodStatus;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the tracker loop
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Status poll interval (default: 5 seconds)
    pub poll_interval: Duration,
    /// Dangling group cleanup interval (default: 5 minutes)
    pub cleanup_interval: Duration,
    /// How long a never-observed pod may be missing from the backend before
    /// it is reported as gone (default: 60 seconds)
    pub not_found_grace: Duration,
    /// Command channel capacity
    pub command_buffer: usize,
    /// Node name used in structured events
    pub node_name: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(300),
            not_found_grace: Duration::from_secs(60),
            command_buffer: 64,
            node_name: "virtual-kubelet".to_string(),
        }
    }
}

/// Result of polling one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Status matched the last notified fingerprint
    Unchanged,
    /// A new status was delivered
    Updated,
    /// Missing from the backend but still inside the grace period
    Pending,
    /// Reported as failed and no longer tracked
    GoneMissing,
    /// Deleted through the provider and now gone from the backend
    Removed,
    /// Transient failure; retried next cycle
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRecord {
    pub at: DateTime<Utc>,
    pub outcome: PollOutcome,
}

/// Tracker state for one pod
#[derive(Debug, Clone)]
pub struct TrackerEntry {
    pub id: UnitId,
    pub uid: Option<String>,
    /// Pod creation time reported by the orchestrator
    pub created_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    /// Last status delivered to the notifier
    pub last_status: Option<PodStatus>,
    pub fingerprint: Option<String>,
    pub last_poll: Option<PollRecord>,
    /// Set once the provider deleted the group
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TrackerEntry {
    fn new(unit: ActiveUnit, now: DateTime<Utc>) -> Self {
        Self {
            id: unit.id,
            uid: unit.uid,
            created_at: unit.created_at,
            first_seen: now,
            last_status: None,
            fingerprint: None,
            last_poll: None,
            deleted_at: None,
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        let since = self.created_at.unwrap_or(self.first_seen);
        (now - since).to_std().unwrap_or_default()
    }
}

/// Counts from one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResults {
    pub polled: usize,
    pub updated: usize,
    pub gone_missing: usize,
    pub error_count: usize,
    /// Cancellation stopped the cycle before every pod was polled
    pub cancelled: bool,
    /// The active set could not be listed; known pods were polled instead
    pub active_set_stale: bool,
}

impl PollResults {
    fn record(&mut self, outcome: &PollOutcome) {
        self.polled += 1;
        match outcome {
            PollOutcome::Updated => self.updated += 1,
            PollOutcome::GoneMissing => self.gone_missing += 1,
            PollOutcome::Failed(_) => self.error_count += 1,
            PollOutcome::Unchanged | PollOutcome::Pending | PollOutcome::Removed => {}
        }
    }
}

/// Hex SHA-256 of the serialized status
pub fn fingerprint(status: &PodStatus) -> String {
    let bytes = serde_json::to_vec(status).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[derive(Debug)]
enum Command {
    MarkDeleted(UnitId),
}

/// Foreground access to a running tracker
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    commands: mpsc::Sender<Command>,
}

impl TrackerHandle {
    /// Tell the tracker the provider deleted this pod's group
    ///
    /// Returns false when the tracker is no longer running.
    pub async fn mark_deleted(&self, id: UnitId) -> bool {
        match self.commands.send(Command::MarkDeleted(id)).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(command)) => {
                debug!(?command, "Tracker stopped, dropping command");
                false
            }
        }
    }
}

/// Reconciles backend status into the orchestrator
pub struct PodTracker {
    source: Arc<dyn StatusSource>,
    active: Arc<dyn ActiveUnitSource>,
    notifier: Arc<dyn StatusNotifier>,
    config: TrackerConfig,
    entries: BTreeMap<UnitId, TrackerEntry>,
    /// Pods already reported missing, until they leave the active set
    tombstones: BTreeSet<(UnitId, Option<String>)>,
    commands: mpsc::Receiver<Command>,
    metrics: ProviderMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl PodTracker {
    pub fn new(
        source: Arc<dyn StatusSource>,
        active: Arc<dyn ActiveUnitSource>,
        notifier: Arc<dyn StatusNotifier>,
        config: TrackerConfig,
    ) -> (Self, TrackerHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let logger = StructuredLogger::new(config.node_name.clone());

        let tracker = Self {
            source,
            active,
            notifier,
            config,
            entries: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            commands: commands_rx,
            metrics: ProviderMetrics::new(),
            logger,
            health: None,
        };

        (tracker, TrackerHandle { commands: commands_tx })
    }

    /// Report cycle outcomes as the tracker component's health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn entry(&self, id: &UnitId) -> Option<&TrackerEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run until cancelled
    ///
    /// Cancellation is observed between pods; a fetch already in flight
    /// completes first.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "Starting pod status tracker"
        );

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick is immediate; cleanup waits a full interval
        cleanup.tick().await;

        let mut cycles = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(tracked = self.entries.len(), "Shutting down pod status tracker");
                    break;
                }

                Some(command) = self.commands.recv() => {
                    match command {
                        Command::MarkDeleted(id) => self.mark_deleted(&id).await,
                    }
                }

                _ = poll.tick() => {
                    let start = Instant::now();
                    let results = self.poll_cycle(&cancel).await;
                    let elapsed = start.elapsed();

                    self.metrics.observe_poll_cycle(elapsed.as_secs_f64());
                    self.metrics.set_tracked_units(self.entries.len() as i64);
                    self.report_health(&results).await;
                    cycles += 1;

                    debug!(
                        cycle = cycles,
                        polled = results.polled,
                        updated = results.updated,
                        gone_missing = results.gone_missing,
                        errors = results.error_count,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Poll cycle complete"
                    );
                }

                _ = cleanup.tick() => {
                    self.cleanup_dangling().await;
                }
            }
        }
    }

    /// Poll every tracked pod once
    pub async fn poll_cycle(&mut self, cancel: &CancellationToken) -> PollResults {
        let mut results = PollResults::default();

        match self.active.active_units().await {
            Ok(units) => self.sync_active_set(units),
            Err(e) => {
                warn!(error = %e, "Failed to list active pods, polling known pods");
                results.active_set_stale = true;
            }
        }

        let ids: Vec<UnitId> = self.entries.keys().cloned().collect();
        for id in ids {
            if cancel.is_cancelled() {
                results.cancelled = true;
                break;
            }
            let outcome = self.poll_unit(&id).await;
            results.record(&outcome);
        }

        results
    }

    async fn report_health(&self, results: &PollResults) {
        let Some(health) = &self.health else {
            return;
        };

        if results.active_set_stale {
            health
                .set_degraded(Component::Tracker, "active pods could not be listed")
                .await;
        } else if results.error_count > 0 {
            health
                .set_degraded(
                    Component::Tracker,
                    format!("{} of {} polls failed", results.error_count, results.polled),
                )
                .await;
        } else {
            health.set_healthy(Component::Tracker).await;
        }
    }

    fn sync_active_set(&mut self, units: Vec<ActiveUnit>) {
        let now = Utc::now();
        let active: BTreeMap<UnitId, ActiveUnit> =
            units.into_iter().map(|u| (u.id.clone(), u)).collect();

        // a pod re-created under the same name carries a new uid; a pod that
        // finished before its group was ever seen has nothing left to report
        self.entries.retain(|id, entry| {
            active.get(id).is_some_and(|u| {
                u.uid == entry.uid && !(u.terminal && entry.last_status.is_none())
            })
        });
        self.tombstones
            .retain(|(id, uid)| active.get(id).is_some_and(|u| &u.uid == uid));

        for (id, unit) in active {
            // deleting pods keep their entry until the delete is confirmed
            if unit.deleting
                || unit.terminal
                || self.entries.contains_key(&id)
                || self.tombstones.contains(&(id.clone(), unit.uid.clone()))
            {
                continue;
            }
            debug!(pod = %id, "Tracking pod");
            self.entries.insert(id, TrackerEntry::new(unit, now));
        }
    }

    async fn poll_unit(&mut self, id: &UnitId) -> PollOutcome {
        let outcome = match self.source.fetch_status(id).await {
            Ok(status) => self.observe(id, status).await,
            Err(e) if e.is_not_found() => self.handle_not_found(id).await,
            Err(e) => {
                self.metrics.inc_poll_errors();
                warn!(pod = %id, error = %e, "Failed to fetch pod status");
                PollOutcome::Failed(e.to_string())
            }
        };

        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_poll = Some(PollRecord {
                at: Utc::now(),
                outcome: outcome.clone(),
            });
        }
        outcome
    }

    async fn observe(&mut self, id: &UnitId, status: PodStatus) -> PollOutcome {
        let Some(entry) = self.entries.get_mut(id) else {
            return PollOutcome::Unchanged;
        };
        // the delete was already reported; the group is on its way out
        if entry.deleted_at.is_some() {
            return PollOutcome::Unchanged;
        }

        let fingerprint = fingerprint(&status);
        if entry.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return PollOutcome::Unchanged;
        }

        if let Err(e) = self.notifier.notify(id, &status).await {
            self.metrics.inc_poll_errors();
            warn!(pod = %id, error = %e, "Failed to deliver pod status");
            return PollOutcome::Failed(e.to_string());
        }

        self.metrics.inc_status_notifications();
        self.logger
            .log_status_changed(&id.namespace, &id.name, status.phase.as_deref());
        entry.fingerprint = Some(fingerprint);
        entry.last_status = Some(status);
        PollOutcome::Updated
    }

    async fn handle_not_found(&mut self, id: &UnitId) -> PollOutcome {
        let now = Utc::now();
        let Some(entry) = self.entries.get(id) else {
            return PollOutcome::Unchanged;
        };

        if entry.deleted_at.is_some() {
            debug!(pod = %id, "Deleted container group is gone");
            self.retire(id);
            return PollOutcome::Removed;
        }

        if entry.last_status.is_none() && entry.age(now) < self.config.not_found_grace {
            debug!(pod = %id, "Container group not visible yet");
            return PollOutcome::Pending;
        }

        let uid = entry.uid.clone();
        let mut status = entry.last_status.clone().unwrap_or_default();
        mark_pod_deleted(&mut status, now);

        if let Err(e) = self.notifier.notify(id, &status).await {
            self.metrics.inc_poll_errors();
            warn!(pod = %id, error = %e, "Failed to deliver gone-missing status");
            return PollOutcome::Failed(e.to_string());
        }

        self.metrics.inc_status_notifications();
        self.metrics.inc_gone_missing();
        self.logger
            .log_unit_gone_missing(&id.namespace, &id.name, uid.as_deref());
        self.retire(id);
        PollOutcome::GoneMissing
    }

    fn retire(&mut self, id: &UnitId) {
        if let Some(entry) = self.entries.remove(id) {
            self.tombstones.insert((entry.id, entry.uid));
        }
    }

    /// Terminate running containers of a pod the provider just deleted
    ///
    /// The entry stays until the backend stops returning the group.
    pub async fn mark_deleted(&mut self, id: &UnitId) {
        let Some(entry) = self.entries.get_mut(id) else {
            debug!(pod = %id, "Deleted pod is not tracked");
            return;
        };
        let now = Utc::now();
        entry.deleted_at = Some(now);

        let Some(mut status) = entry.last_status.clone() else {
            return;
        };
        terminate_running_containers(&mut status, now);

        let fingerprint = fingerprint(&status);
        if entry.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return;
        }

        match self.notifier.notify(id, &status).await {
            Ok(()) => {
                self.metrics.inc_status_notifications();
                entry.fingerprint = Some(fingerprint);
                entry.last_status = Some(status);
            }
            Err(e) => warn!(pod = %id, error = %e, "Failed to deliver deleted pod status"),
        }
    }

    /// Delete backend groups the orchestrator no longer expects
    ///
    /// Returns the number of groups removed.
    pub async fn cleanup_dangling(&self) -> usize {
        let active: BTreeSet<UnitId> = match self.active.active_units().await {
            Ok(units) => units.into_iter().map(|u| u.id).collect(),
            Err(e) => {
                warn!(error = %e, "Skipping cleanup, active pods unavailable");
                return 0;
            }
        };
        let backend = match self.source.list_backend_units().await {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "Skipping cleanup, backend listing failed");
                return 0;
            }
        };

        let mut removed = 0;
        for id in backend.into_iter().filter(|id| !active.contains(id)) {
            match self.source.cleanup_unit(&id).await {
                Ok(()) => {
                    info!(pod = %id, "Removed dangling container group");
                    removed += 1;
                }
                Err(ProviderError::NotFound(_)) => {}
                Err(e) => warn!(pod = %id, error = %e, "Failed to remove dangling container group"),
            }
        }
        removed
    }
}

/// Builder for the tracker
pub struct TrackerBuilder {
    source: Option<Arc<dyn StatusSource>>,
    active: Option<Arc<dyn ActiveUnitSource>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
    config: TrackerConfig,
    health: Option<HealthRegistry>,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            active: None,
            notifier: None,
            config: TrackerConfig::default(),
            health: None,
        }
    }

    pub fn source(mut self, source: Arc<dyn StatusSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn active_units(mut self, active: Arc<dyn ActiveUnitSource>) -> Self {
        self.active = Some(active);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn not_found_grace(mut self, grace: Duration) -> Self {
        self.config.not_found_grace = grace;
        self
    }

    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.config.node_name = node_name.into();
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<(PodTracker, TrackerHandle)> {
        let source = self
            .source
            .ok_or_else(|| ProviderError::configuration("status source is required"))?;
        let active = self
            .active
            .ok_or_else(|| ProviderError::configuration("active unit source is required"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| ProviderError::configuration("status notifier is required"))?;

        let (mut tracker, handle) = PodTracker::new(source, active, notifier, self.config);
        if let Some(health) = self.health {
            tracker = tracker.with_health(health);
        }
        Ok((tracker, handle))
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
