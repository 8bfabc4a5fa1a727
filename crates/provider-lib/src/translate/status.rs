//! Backend snapshot to pod status

use super::validation::validate_container_group;
use crate::aci;
use crate::error::{ProviderError, Result};
use crate::models::tags;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, ContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodSpec, PodStatus,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_SUCCEEDED: &str = "Succeeded";
pub const PHASE_FAILED: &str = "Failed";
pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_UNKNOWN: &str = "Unknown";

/// Reason reported for pods whose container group disappeared
pub const REASON_NOT_FOUND: &str = "NotFound";
pub const MESSAGE_POD_DELETED: &str = "The pod may have been deleted from the provider";
pub const EXIT_CODE_POD_DELETED: i32 = 0;

const STATE_RUNNING: &str = "Running";
const STATE_TERMINATED: &str = "Terminated";
const STATE_CREATING: &str = "Creating";

/// Pod phase for a backend group or container state
pub fn phase_from_state(state: &str) -> &'static str {
    match state {
        "Running" => PHASE_RUNNING,
        "Succeeded" => PHASE_SUCCEEDED,
        "Failed" | "Canceled" => PHASE_FAILED,
        "Creating" | "Repairing" | "Pending" | "Accepted" => PHASE_PENDING,
        _ => PHASE_UNKNOWN,
    }
}

/// Stable container id derived from the group id and container name
pub fn container_id(group_id: &str, container_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(group_id.as_bytes());
    hasher.update(container_name.as_bytes());
    format!("aci://{}", hex::encode(hasher.finalize()))
}

fn container_state(state: Option<&aci::ContainerState>) -> ContainerState {
    let state = state.cloned().unwrap_or_default();
    let name = state.state.as_deref().unwrap_or_default();

    match name {
        STATE_RUNNING => ContainerState {
            running: Some(ContainerStateRunning {
                started_at: state.start_time.map(Time),
            }),
            ..Default::default()
        },
        STATE_TERMINATED => ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: state.exit_code.unwrap_or_default(),
                reason: Some(name.to_string()),
                message: state.detail_status.clone(),
                started_at: state.start_time.map(Time),
                finished_at: state.finish_time.map(Time),
                ..Default::default()
            }),
            ..Default::default()
        },
        _ => {
            let reason = if name.is_empty() { STATE_CREATING } else { name };
            ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_string()),
                    message: state.detail_status.clone(),
                }),
                ..Default::default()
            }
        }
    }
}

fn container_status(
    group_id: &str,
    name: &str,
    image: &str,
    view: Option<&aci::ContainerInstanceView>,
) -> ContainerStatus {
    let current = view.and_then(|v| v.current_state.as_ref());
    let running = current.and_then(|s| s.state.as_deref()) == Some(STATE_RUNNING);

    ContainerStatus {
        name: name.to_string(),
        image: image.to_string(),
        container_id: Some(container_id(group_id, name)),
        state: Some(container_state(current)),
        last_state: view
            .and_then(|v| v.previous_state.as_ref())
            .map(|s| container_state(Some(s))),
        ready: running,
        started: Some(running),
        restart_count: view.and_then(|v| v.restart_count).unwrap_or_default(),
        ..Default::default()
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn conditions(phase: &str, transition: Option<DateTime<Utc>>) -> Option<Vec<PodCondition>> {
    if phase != PHASE_RUNNING && phase != PHASE_SUCCEEDED {
        return None;
    }

    let condition = |type_: &str| PodCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        last_transition_time: transition.map(Time),
        ..Default::default()
    };
    Some(vec![
        condition("Ready"),
        condition("Initialized"),
        condition("PodScheduled"),
    ])
}

/// Translate a snapshot into pod status
///
/// Validation runs first; a malformed snapshot is a `Translation` error.
/// The result is a pure function of its inputs, so equal snapshots give
/// equal statuses.
pub fn pod_status_from_group(group: &aci::ContainerGroup, internal_ip: &str) -> Result<PodStatus> {
    validate_container_group(group)?;
    let props = group
        .properties
        .as_ref()
        .ok_or_else(|| ProviderError::translation("properties are missing"))?;
    let group_id = group.id.as_deref().unwrap_or_default();

    let state = props
        .instance_view
        .as_ref()
        .and_then(|v| v.state.as_deref())
        .filter(|s| !s.is_empty())
        .or(props.provisioning_state.as_deref())
        .unwrap_or_default();
    let phase = phase_from_state(state);

    let created = group.tag(tags::CREATION_TIMESTAMP).and_then(parse_timestamp);

    let container_statuses: Vec<ContainerStatus> = props
        .containers
        .iter()
        .map(|c| {
            container_status(
                group_id,
                &c.name,
                &c.properties.image,
                c.properties.instance_view.as_ref(),
            )
        })
        .collect();

    let init_container_statuses: Vec<ContainerStatus> = props
        .init_containers
        .iter()
        .map(|c| {
            container_status(
                group_id,
                &c.name,
                &c.properties.image,
                c.properties.instance_view.as_ref(),
            )
        })
        .collect();

    let first_start = props
        .containers
        .iter()
        .filter_map(|c| c.properties.instance_view.as_ref())
        .filter_map(|v| v.current_state.as_ref())
        .filter_map(|s| s.start_time)
        .min();

    Ok(PodStatus {
        phase: Some(phase.to_string()),
        conditions: conditions(phase, created),
        host_ip: Some(internal_ip.to_string()),
        pod_ip: props.ip_address.as_ref().and_then(|ip| ip.ip.clone()),
        start_time: created.or(first_start).map(Time),
        container_statuses: Some(container_statuses),
        init_container_statuses: (!init_container_statuses.is_empty())
            .then_some(init_container_statuses),
        ..Default::default()
    })
}

/// Rebuild the pod a snapshot was created from
pub fn pod_from_group(group: &aci::ContainerGroup, internal_ip: &str) -> Result<Pod> {
    let status = pod_status_from_group(group, internal_ip)?;
    let props = group
        .properties
        .as_ref()
        .ok_or_else(|| ProviderError::translation("properties are missing"))?;

    let containers = props
        .containers
        .iter()
        .map(|c| {
            let requests = &c.properties.resources.requests;
            Container {
                name: c.name.clone(),
                image: Some(c.properties.image.clone()),
                command: (!c.properties.command.is_empty()).then(|| c.properties.command.clone()),
                ports: (!c.properties.ports.is_empty()).then(|| {
                    c.properties
                        .ports
                        .iter()
                        .map(|p| ContainerPort {
                            container_port: p.port,
                            protocol: p.protocol.clone(),
                            ..Default::default()
                        })
                        .collect()
                }),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity(format!("{:.2}", requests.cpu))),
                        (
                            "memory".to_string(),
                            Quantity(format!("{:.1}G", requests.memory_in_gb)),
                        ),
                    ])),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    let tag = |key: &str| group.tag(key).filter(|v| !v.is_empty()).map(str::to_string);

    Ok(Pod {
        metadata: ObjectMeta {
            name: tag(tags::POD_NAME),
            namespace: tag(tags::NAMESPACE),
            uid: tag(tags::UID),
            creation_timestamp: group
                .tag(tags::CREATION_TIMESTAMP)
                .and_then(parse_timestamp)
                .map(Time),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: tag(tags::NODE_NAME),
            restart_policy: props.restart_policy.clone(),
            containers,
            ..Default::default()
        }),
        status: Some(status),
    })
}

/// Convert running containers to terminated
///
/// Waiting and already terminated containers keep their state.
pub fn terminate_running_containers(status: &mut PodStatus, finished_at: DateTime<Utc>) {
    for container in status.container_statuses.iter_mut().flatten() {
        let Some(running) = container.state.as_ref().and_then(|s| s.running.as_ref()) else {
            continue;
        };
        let started_at = running.started_at.clone();

        container.state = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: EXIT_CODE_POD_DELETED,
                reason: Some(REASON_NOT_FOUND.to_string()),
                message: Some(MESSAGE_POD_DELETED.to_string()),
                started_at,
                finished_at: Some(Time(finished_at)),
                container_id: container.container_id.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        container.ready = false;
        container.started = Some(false);
    }
}

/// Status of a pod whose container group went away
///
/// Running containers are terminated; the phase becomes `Failed` with
/// reason `NotFound`.
pub fn mark_pod_deleted(status: &mut PodStatus, finished_at: DateTime<Utc>) {
    terminate_running_containers(status, finished_at);

    status.phase = Some(PHASE_FAILED.to_string());
    status.reason = Some(REASON_NOT_FOUND.to_string());
    status.message = Some(MESSAGE_POD_DELETED.to_string());
}
