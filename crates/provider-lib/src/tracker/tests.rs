use super::*;
use crate::error::ProviderError;
use crate::health::{Component, HealthRegistry};
use crate::models::{ActiveUnit, UnitId};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PodStatus;
use crate::translate::status::{MESSAGE_POD_DELETED, PHASE_FAILED, PHASE_RUNNING, REASON_NOT_FOUND};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Response {
    Status(PodStatus),
    NotFound,
    Unavailable,
}

/// Backend double returning scripted responses
struct MockSource {
    responses: Mutex<HashMap<UnitId, Response>>,
    backend_units: Mutex<Vec<UnitId>>,
    cleaned: Mutex<Vec<UnitId>>,
    call_count: AtomicUsize,
}

impl MockSource {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            backend_units: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    fn respond(&self, id: &UnitId, response: Response) {
        self.responses.lock().unwrap().insert(id.clone(), response);
    }

    fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusSource for MockSource {
    async fn fetch_status(&self, id: &UnitId) -> crate::error::Result<PodStatus> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let response = self.responses.lock().unwrap().get(id).cloned();
        match response {
            Some(Response::Status(status)) => Ok(status),
            Some(Response::Unavailable) => Err(ProviderError::Backend("503".to_string())),
            Some(Response::NotFound) | None => Err(ProviderError::NotFound(id.group_name())),
        }
    }

    async fn list_backend_units(&self) -> crate::error::Result<Vec<UnitId>> {
        Ok(self.backend_units.lock().unwrap().clone())
    }

    async fn cleanup_unit(&self, id: &UnitId) -> crate::error::Result<()> {
        self.cleaned.lock().unwrap().push(id.clone());
        Ok(())
    }
}

struct MockActive {
    units: Mutex<Vec<ActiveUnit>>,
}

impl MockActive {
    fn new(units: Vec<ActiveUnit>) -> Self {
        Self {
            units: Mutex::new(units),
        }
    }

    fn set(&self, units: Vec<ActiveUnit>) {
        *self.units.lock().unwrap() = units;
    }
}

#[async_trait]
impl ActiveUnitSource for MockActive {
    async fn active_units(&self) -> crate::error::Result<Vec<ActiveUnit>> {
        Ok(self.units.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    notifications: Mutex<Vec<(UnitId, PodStatus)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    fn count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    fn last(&self) -> PodStatus {
        self.notifications.lock().unwrap().last().unwrap().1.clone()
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, id: &UnitId, status: &PodStatus) -> crate::error::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::Backend("orchestrator unavailable".to_string()));
        }
        self.notifications
            .lock()
            .unwrap()
            .push((id.clone(), status.clone()));
        Ok(())
    }
}

fn unit(name: &str, created_at: DateTime<Utc>) -> ActiveUnit {
    ActiveUnit {
        id: UnitId::new("default", name),
        uid: Some(format!("{name}-uid")),
        created_at: Some(created_at),
        deleting: false,
        terminal: false,
    }
}

fn old_unit(name: &str) -> ActiveUnit {
    unit(name, Utc::now() - chrono::Duration::minutes(10))
}

fn running_status(started: DateTime<Utc>) -> PodStatus {
    PodStatus {
        phase: Some(PHASE_RUNNING.to_string()),
        container_statuses: Some(vec![ContainerStatus {
            name: "nginx".to_string(),
            image: "nginx:1.25".to_string(),
            image_id: String::new(),
            ready: true,
            restart_count: 0,
            container_id: Some("aci://abc".to_string()),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(Time(started)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

struct Harness {
    source: Arc<MockSource>,
    active: Arc<MockActive>,
    notifier: Arc<RecordingNotifier>,
    tracker: PodTracker,
    handle: TrackerHandle,
}

fn harness(units: Vec<ActiveUnit>) -> Harness {
    harness_with(units, TrackerConfig::default())
}

fn harness_with(units: Vec<ActiveUnit>, config: TrackerConfig) -> Harness {
    let source = Arc::new(MockSource::new());
    let active = Arc::new(MockActive::new(units));
    let notifier = Arc::new(RecordingNotifier::default());
    let (tracker, handle) = TrackerBuilder::new()
        .source(source.clone())
        .active_units(active.clone())
        .notifier(notifier.clone())
        .config(config)
        .build()
        .unwrap();

    Harness {
        source,
        active,
        notifier,
        tracker,
        handle,
    }
}

#[test]
fn test_tracker_config_default() {
    let config = TrackerConfig::default();
    assert_eq!(config.poll_interval, Duration::from_secs(5));
    assert_eq!(config.cleanup_interval, Duration::from_secs(300));
    assert_eq!(config.not_found_grace, Duration::from_secs(60));
    assert_eq!(config.command_buffer, 64);
}

#[test]
fn test_builder_missing_notifier() {
    let result = TrackerBuilder::new()
        .source(Arc::new(MockSource::new()))
        .active_units(Arc::new(MockActive::new(Vec::new())))
        .build();

    assert!(matches!(result, Err(ProviderError::Configuration(_))));
}

#[test]
fn test_fingerprint_tracks_content() {
    let started = Utc::now();
    let a = running_status(started);
    let mut b = running_status(started);
    assert_eq!(fingerprint(&a), fingerprint(&b));

    b.phase = Some(PHASE_FAILED.to_string());
    assert_ne!(fingerprint(&a), fingerprint(&b));
}

#[tokio::test]
async fn test_unchanged_status_notifies_once() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    let cancel = CancellationToken::new();

    let first = h.tracker.poll_cycle(&cancel).await;
    let second = h.tracker.poll_cycle(&cancel).await;

    assert_eq!(first.updated, 1);
    assert_eq!(second.updated, 0);
    assert_eq!(h.source.calls(), 2);
    assert_eq!(h.notifier.count(), 1);
    assert_eq!(
        h.tracker.entry(&id).unwrap().last_poll.as_ref().unwrap().outcome,
        PollOutcome::Unchanged
    );
}

#[tokio::test]
async fn test_changed_status_notifies_again() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    let started = Utc::now();
    let cancel = CancellationToken::new();

    h.source.respond(&id, Response::Status(running_status(started)));
    h.tracker.poll_cycle(&cancel).await;

    let mut finished = running_status(started);
    finished.phase = Some("Succeeded".to_string());
    h.source.respond(&id, Response::Status(finished));
    h.tracker.poll_cycle(&cancel).await;

    assert_eq!(h.notifier.count(), 2);
    assert_eq!(h.notifier.last().phase.as_deref(), Some("Succeeded"));
}

#[tokio::test]
async fn test_gone_missing_reports_once() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    let started = Utc::now() - chrono::Duration::minutes(5);
    let cancel = CancellationToken::new();

    h.source.respond(&id, Response::Status(running_status(started)));
    h.tracker.poll_cycle(&cancel).await;

    h.source.respond(&id, Response::NotFound);
    let results = h.tracker.poll_cycle(&cancel).await;
    assert_eq!(results.gone_missing, 1);
    assert_eq!(h.notifier.count(), 2);

    let status = h.notifier.last();
    assert_eq!(status.phase.as_deref(), Some(PHASE_FAILED));
    assert_eq!(status.reason.as_deref(), Some(REASON_NOT_FOUND));
    let terminated = status.container_statuses.unwrap()[0]
        .state
        .clone()
        .unwrap()
        .terminated
        .unwrap();
    assert_eq!(terminated.exit_code, 0);
    assert_eq!(terminated.reason.as_deref(), Some(REASON_NOT_FOUND));
    assert_eq!(terminated.message.as_deref(), Some(MESSAGE_POD_DELETED));
    assert_eq!(terminated.started_at, Some(Time(started)));
    assert!(h.tracker.entry(&id).is_none());

    // still in the active set, but already reported
    let calls = h.source.calls();
    h.tracker.poll_cycle(&cancel).await;
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.notifier.count(), 2);
    assert_eq!(h.source.calls(), calls);
}

#[tokio::test]
async fn test_recreated_pod_is_tracked_again() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    let cancel = CancellationToken::new();

    h.source.respond(&id, Response::NotFound);
    h.tracker.poll_cycle(&cancel).await;
    assert!(h.tracker.is_empty());

    let mut recreated = old_unit("web");
    recreated.uid = Some("web-uid-2".to_string());
    h.active.set(vec![recreated]);
    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    h.tracker.poll_cycle(&cancel).await;

    assert_eq!(h.tracker.len(), 1);
    assert_eq!(
        h.tracker.entry(&id).unwrap().uid.as_deref(),
        Some("web-uid-2")
    );
    assert_eq!(h.notifier.last().phase.as_deref(), Some(PHASE_RUNNING));
}

#[tokio::test]
async fn test_transient_error_keeps_fingerprint() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    let status = running_status(Utc::now());
    let cancel = CancellationToken::new();

    h.source.respond(&id, Response::Status(status.clone()));
    h.tracker.poll_cycle(&cancel).await;
    let fingerprint_before = h.tracker.entry(&id).unwrap().fingerprint.clone();

    h.source.respond(&id, Response::Unavailable);
    let results = h.tracker.poll_cycle(&cancel).await;
    assert_eq!(results.error_count, 1);
    let entry = h.tracker.entry(&id).unwrap();
    assert_eq!(entry.fingerprint, fingerprint_before);
    assert!(matches!(
        entry.last_poll.as_ref().unwrap().outcome,
        PollOutcome::Failed(_)
    ));

    h.source.respond(&id, Response::Status(status));
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_failed_delivery_is_retried() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    let cancel = CancellationToken::new();

    h.notifier.fail.store(true, Ordering::SeqCst);
    h.tracker.poll_cycle(&cancel).await;
    assert!(h.tracker.entry(&id).unwrap().fingerprint.is_none());

    h.notifier.fail.store(false, Ordering::SeqCst);
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.notifier.count(), 1);
}

#[tokio::test]
async fn test_new_pod_missing_within_grace_is_kept() {
    let mut h = harness(vec![unit("web", Utc::now())]);
    let id = UnitId::new("default", "web");
    let cancel = CancellationToken::new();

    h.source.respond(&id, Response::NotFound);
    h.tracker.poll_cycle(&cancel).await;

    assert_eq!(h.notifier.count(), 0);
    assert_eq!(
        h.tracker.entry(&id).unwrap().last_poll.as_ref().unwrap().outcome,
        PollOutcome::Pending
    );
}

#[tokio::test]
async fn test_old_never_observed_pod_is_reported_failed() {
    let mut h = harness(vec![old_unit("web")]);
    let cancel = CancellationToken::new();

    let results = h.tracker.poll_cycle(&cancel).await;

    assert_eq!(results.gone_missing, 1);
    let status = h.notifier.last();
    assert_eq!(status.phase.as_deref(), Some(PHASE_FAILED));
    assert!(status.container_statuses.is_none());
}

#[tokio::test]
async fn test_mark_deleted_terminates_running_containers() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    let cancel = CancellationToken::new();

    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    h.tracker.poll_cycle(&cancel).await;

    h.tracker.mark_deleted(&id).await;
    assert_eq!(h.notifier.count(), 2);
    let status = h.notifier.last();
    assert_eq!(status.phase.as_deref(), Some(PHASE_RUNNING));
    let container = &status.container_statuses.unwrap()[0];
    assert!(!container.ready);
    assert!(container.state.as_ref().unwrap().terminated.is_some());

    // the group lingers while the backend deletes it
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.notifier.count(), 2);

    h.source.respond(&id, Response::NotFound);
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.notifier.count(), 2);
    assert!(h.tracker.is_empty());
}

#[tokio::test]
async fn test_pod_leaving_active_set_is_dropped() {
    let mut h = harness(vec![old_unit("web"), old_unit("api")]);
    let cancel = CancellationToken::new();
    for name in ["web", "api"] {
        h.source.respond(
            &UnitId::new("default", name),
            Response::Status(running_status(Utc::now())),
        );
    }
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.tracker.len(), 2);

    h.active.set(vec![old_unit("api")]);
    let results = h.tracker.poll_cycle(&cancel).await;

    assert_eq!(results.polled, 1);
    assert!(h.tracker.entry(&UnitId::new("default", "web")).is_none());
}

#[tokio::test]
async fn test_deleting_pod_stays_tracked_until_delete_confirmed() {
    let mut h = harness(vec![old_unit("web")]);
    let id = UnitId::new("default", "web");
    let cancel = CancellationToken::new();
    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    h.tracker.poll_cycle(&cancel).await;

    h.active.set(vec![ActiveUnit {
        deleting: true,
        ..old_unit("web")
    }]);
    let results = h.tracker.poll_cycle(&cancel).await;
    assert_eq!(results.polled, 1);
    assert!(h.tracker.entry(&id).is_some());

    h.tracker.mark_deleted(&id).await;
    assert_eq!(h.notifier.count(), 2);
    let container = &h.notifier.last().container_statuses.unwrap()[0];
    assert!(container.state.as_ref().unwrap().terminated.is_some());

    h.source.respond(&id, Response::NotFound);
    h.tracker.poll_cycle(&cancel).await;
    assert_eq!(h.notifier.count(), 2);
    assert!(h.tracker.is_empty());
}

#[tokio::test]
async fn test_unknown_deleting_or_finished_pods_are_not_tracked() {
    let mut h = harness(vec![
        ActiveUnit {
            deleting: true,
            ..old_unit("web")
        },
        ActiveUnit {
            terminal: true,
            ..old_unit("job")
        },
    ]);
    let cancel = CancellationToken::new();

    let results = h.tracker.poll_cycle(&cancel).await;

    assert_eq!(results.polled, 0);
    assert_eq!(results.gone_missing, 0);
    assert_eq!(h.source.calls(), 0);
    assert_eq!(h.notifier.count(), 0);
    assert!(h.tracker.is_empty());
}

#[tokio::test]
async fn test_rejected_pod_is_not_reported_missing() {
    let mut h = harness(vec![unit("bad", Utc::now())]);
    let id = UnitId::new("default", "bad");
    let cancel = CancellationToken::new();

    // no group was ever created
    let first = h.tracker.poll_cycle(&cancel).await;
    assert_eq!(first.gone_missing, 0);
    assert!(h.tracker.entry(&id).is_some());

    // the pod is marked Failed and the grace period has long passed
    h.active.set(vec![ActiveUnit {
        terminal: true,
        ..old_unit("bad")
    }]);
    let second = h.tracker.poll_cycle(&cancel).await;

    assert_eq!(second.gone_missing, 0);
    assert_eq!(h.source.calls(), 1);
    assert_eq!(h.notifier.count(), 0);
    assert!(h.tracker.is_empty());
}

#[tokio::test]
async fn test_finished_pod_that_ran_stays_tracked() {
    let mut h = harness(vec![old_unit("job")]);
    let id = UnitId::new("default", "job");
    let cancel = CancellationToken::new();
    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    h.tracker.poll_cycle(&cancel).await;

    h.active.set(vec![ActiveUnit {
        terminal: true,
        ..old_unit("job")
    }]);
    let results = h.tracker.poll_cycle(&cancel).await;

    assert_eq!(results.polled, 1);
    assert!(h.tracker.entry(&id).is_some());
}

#[tokio::test]
async fn test_cleanup_removes_dangling_groups() {
    let h = harness(vec![old_unit("web")]);
    *h.source.backend_units.lock().unwrap() = vec![
        UnitId::new("default", "web"),
        UnitId::new("default", "orphan"),
    ];

    let removed = h.tracker.cleanup_dangling().await;

    assert_eq!(removed, 1);
    assert_eq!(
        *h.source.cleaned.lock().unwrap(),
        vec![UnitId::new("default", "orphan")]
    );
}

#[tokio::test]
async fn test_cancelled_cycle_polls_nothing() {
    let mut h = harness(vec![old_unit("api"), old_unit("web")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = h.tracker.poll_cycle(&cancel).await;

    assert!(results.cancelled);
    assert_eq!(results.polled, 0);
    assert_eq!(h.source.calls(), 0);
}

#[tokio::test]
async fn test_run_handles_commands_and_stops_on_cancel() {
    let config = TrackerConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness_with(vec![old_unit("web")], config);
    let id = UnitId::new("default", "web");
    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));

    let notifier = h.notifier.clone();
    let handle = h.handle.clone();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.tracker.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(5), async {
        while notifier.count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(handle.mark_deleted(id).await);
    tokio::time::timeout(Duration::from_secs(5), async {
        while notifier.count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert!(!handle.mark_deleted(UnitId::new("default", "web")).await);
}

#[tokio::test]
async fn test_failed_polls_degrade_tracker_health() {
    let config = TrackerConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness_with(vec![old_unit("web")], config);
    let id = UnitId::new("default", "web");
    h.source.respond(&id, Response::Unavailable);

    let registry = HealthRegistry::new();
    registry.register(Component::Tracker).await;
    let cancel = CancellationToken::new();
    let task = tokio::spawn(h.tracker.with_health(registry.clone()).run(cancel.clone()));

    let degraded = |registry: HealthRegistry| async move {
        registry.health().await.components[&Component::Tracker].status
            == crate::health::ComponentStatus::Degraded
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while !degraded(registry.clone()).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.source
        .respond(&id, Response::Status(running_status(Utc::now())));
    tokio::time::timeout(Duration::from_secs(5), async {
        while degraded(registry.clone()).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    task.await.unwrap();
}
