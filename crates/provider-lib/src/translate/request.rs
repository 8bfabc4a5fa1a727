//! Pod spec to container group request

use super::credentials::image_registry_credentials;
use super::probes::translate_probe;
use super::resources::{translate_resources, GpuContext};
use super::volumes::{strip_service_account_volumes, translate_volumes};
use super::{secret_value, ReferencedResources, TranslationContext};
use crate::aci;
use crate::error::{ProviderError, Result};
use crate::models::{annotations, tags};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod};
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_RESTART_POLICY: &str = "Always";

const DNS_OPTIONS: &str = "ndots:5";

/// Build the backend create request for a pod
///
/// Every validation rule runs here, so a pod that returns `Ok` can be sent
/// to the backend as-is.
pub fn build_container_group(
    pod: &Pod,
    ctx: &TranslationContext,
    resources: &ReferencedResources,
) -> Result<aci::ContainerGroup> {
    let spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| ProviderError::validation("pod has no spec"))?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ProviderError::validation("pod has no name"))?;

    let pod_annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let gpu = GpuContext {
        supported_skus: &ctx.gpu_skus,
        requested_sku: pod_annotations.get(annotations::GPU_TYPE).map(String::as_str),
        region: &ctx.region,
    };

    let containers = spec
        .containers
        .iter()
        .map(|c| translate_container(c, gpu, resources))
        .collect::<Result<Vec<_>>>()?;

    let init_containers = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| translate_init_container(c, resources))
        .collect::<Result<Vec<_>>>()?;

    let mut props = aci::ContainerGroupProperties {
        containers,
        init_containers,
        image_registry_credentials: image_registry_credentials(spec, resources)?,
        restart_policy: Some(
            spec.restart_policy
                .clone()
                .unwrap_or_else(|| DEFAULT_RESTART_POLICY.to_string()),
        ),
        os_type: ctx.os_type.clone(),
        volumes: translate_volumes(pod, resources)?,
        diagnostics: diagnostics_for(ctx.diagnostics.as_ref(), pod.metadata.uid.as_deref()),
        ..Default::default()
    };

    if ctx.os_type.eq_ignore_ascii_case(aci::OS_TYPE_WINDOWS) {
        strip_service_account_volumes(&mut props);
    }

    let ports: Vec<aci::Port> = props
        .containers
        .iter()
        .flat_map(|c| c.properties.ports.iter())
        .map(|p| aci::Port {
            port: p.port,
            protocol: p.protocol.clone(),
        })
        .collect();

    match &ctx.subnet {
        Some(subnet) => {
            props.subnet_ids = vec![aci::SubnetId {
                id: subnet.subnet_id.clone(),
                name: subnet.subnet_name.clone(),
            }];
            props.dns_config = Some(aci::DnsConfig {
                name_servers: vec![subnet.dns_server.clone()],
                search_domains: Some(format!(
                    "{namespace}.svc.{domain} svc.{domain} {domain}",
                    domain = subnet.cluster_domain
                )),
                options: Some(DNS_OPTIONS.to_string()),
            });
        }
        None if !ports.is_empty() => {
            props.ip_address = Some(aci::IpAddress {
                ports,
                ip_type: aci::IP_ADDRESS_TYPE_PUBLIC.to_string(),
                dns_name_label: pod_annotations
                    .get(annotations::DNS_NAME_LABEL)
                    .filter(|label| !label.is_empty())
                    .cloned(),
                ..Default::default()
            });
        }
        None => {}
    }

    let mut group_tags = BTreeMap::from([
        (tags::POD_NAME.to_string(), name.to_string()),
        (tags::NAMESPACE.to_string(), namespace.to_string()),
        (
            tags::NODE_NAME.to_string(),
            spec.node_name.clone().unwrap_or_else(|| ctx.node_name.clone()),
        ),
        (tags::CLUSTER_NAME.to_string(), ctx.cluster_name.clone()),
        (
            tags::UID.to_string(),
            pod.metadata.uid.clone().unwrap_or_default(),
        ),
    ]);
    if let Some(created) = &pod.metadata.creation_timestamp {
        group_tags.insert(tags::CREATION_TIMESTAMP.to_string(), created.0.to_rfc3339());
    }

    debug!(
        pod = %format!("{namespace}/{name}"),
        containers = props.containers.len(),
        volumes = props.volumes.len(),
        "Built container group request"
    );

    Ok(aci::ContainerGroup {
        name: Some(format!("{namespace}-{name}")),
        location: Some(ctx.region.clone()),
        tags: group_tags,
        properties: Some(props),
        ..Default::default()
    })
}

/// Reject `args` given without `command`; the backend has no image entrypoint override
pub fn verify_command(container: &Container) -> Result<()> {
    let has_command = container.command.as_ref().is_some_and(|c| !c.is_empty());
    let has_args = container.args.as_ref().is_some_and(|a| !a.is_empty());
    if has_args && !has_command {
        return Err(ProviderError::validation(format!(
            "container {}: providing args without specifying the command is not supported, supply both command and args",
            container.name
        )));
    }
    Ok(())
}

fn command(container: &Container) -> Vec<String> {
    container
        .command
        .iter()
        .flatten()
        .chain(container.args.iter().flatten())
        .cloned()
        .collect()
}

fn volume_mounts(container: &Container) -> Vec<aci::VolumeMount> {
    container
        .volume_mounts
        .iter()
        .flatten()
        .map(|m| aci::VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
            read_only: m.read_only,
        })
        .collect()
}

fn protocol(raw: Option<&str>) -> String {
    match raw {
        Some(p) if p.eq_ignore_ascii_case(aci::PROTOCOL_UDP) => aci::PROTOCOL_UDP.to_string(),
        _ => aci::PROTOCOL_TCP.to_string(),
    }
}

fn translate_container(
    container: &Container,
    gpu: GpuContext<'_>,
    resources: &ReferencedResources,
) -> Result<aci::Container> {
    verify_command(container)?;

    let pod_ports = container.ports.clone().unwrap_or_default();
    let ports = pod_ports
        .iter()
        .map(|p| aci::ContainerPort {
            port: p.container_port,
            protocol: Some(protocol(p.protocol.as_deref())),
        })
        .collect();

    let liveness_probe = container
        .liveness_probe
        .as_ref()
        .map(|probe| translate_probe(probe, &pod_ports))
        .transpose()?;
    let readiness_probe = container
        .readiness_probe
        .as_ref()
        .map(|probe| translate_probe(probe, &pod_ports))
        .transpose()?;

    Ok(aci::Container {
        name: container.name.clone(),
        properties: aci::ContainerProperties {
            image: container.image.clone().unwrap_or_default(),
            command: command(container),
            ports,
            environment_variables: environment_variables(container, resources)?,
            resources: translate_resources(container.resources.as_ref(), gpu)?,
            volume_mounts: volume_mounts(container),
            liveness_probe,
            readiness_probe,
            instance_view: None,
        },
    })
}

fn translate_init_container(
    container: &Container,
    resources: &ReferencedResources,
) -> Result<aci::InitContainer> {
    verify_command(container)?;

    let unsupported = |what: &str| {
        ProviderError::validation(format!(
            "init container {}: {what} is not supported",
            container.name
        ))
    };

    if container.ports.as_ref().is_some_and(|p| !p.is_empty()) {
        return Err(unsupported("ports"));
    }
    if let Some(requirements) = &container.resources {
        if requirements.requests.as_ref().is_some_and(|r| !r.is_empty()) {
            return Err(unsupported("resource requests"));
        }
        if requirements.limits.as_ref().is_some_and(|l| !l.is_empty()) {
            return Err(unsupported("resource limits"));
        }
    }
    if container.liveness_probe.is_some() {
        return Err(unsupported("livenessProbe"));
    }
    if container.readiness_probe.is_some() {
        return Err(unsupported("readinessProbe"));
    }

    Ok(aci::InitContainer {
        name: container.name.clone(),
        properties: aci::InitContainerProperties {
            image: container.image.clone().unwrap_or_default(),
            command: command(container),
            environment_variables: environment_variables(container, resources)?,
            volume_mounts: volume_mounts(container),
            instance_view: None,
        },
    })
}

/// Resolve environment variables; empty values are dropped
fn environment_variables(
    container: &Container,
    resources: &ReferencedResources,
) -> Result<Vec<aci::EnvironmentVariable>> {
    let mut variables = Vec::new();

    for env in container.env.iter().flatten() {
        if let Some(variable) = environment_variable(env, resources)? {
            variables.push(variable);
        }
    }

    Ok(variables)
}

fn environment_variable(
    env: &EnvVar,
    resources: &ReferencedResources,
) -> Result<Option<aci::EnvironmentVariable>> {
    if let Some(value) = env.value.as_ref().filter(|v| !v.is_empty()) {
        return Ok(Some(aci::EnvironmentVariable::plain(&env.name, value)));
    }

    let Some(source) = &env.value_from else {
        return Ok(None);
    };

    if let Some(selector) = &source.secret_key_ref {
        let secret_name = selector.name.as_deref().unwrap_or_default();
        let value = resources
            .secret(secret_name)
            .and_then(|secret| secret_value(secret, &selector.key));
        let value = match value {
            Some(raw) => String::from_utf8(raw).map_err(|_| {
                ProviderError::validation(format!(
                    "env {}: key {} of secret {secret_name:?} is not UTF-8",
                    env.name, selector.key
                ))
            })?,
            None if selector.optional.unwrap_or(false) => return Ok(None),
            None => {
                return Err(ProviderError::validation(format!(
                    "env {}: key {} of secret {secret_name:?} not found",
                    env.name, selector.key
                )))
            }
        };
        return Ok((!value.is_empty()).then(|| aci::EnvironmentVariable::secure(&env.name, value)));
    }

    if let Some(selector) = &source.config_map_key_ref {
        let map_name = selector.name.as_deref().unwrap_or_default();
        let value = resources
            .config_map(map_name)
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(&selector.key))
            .cloned();
        let value = match value {
            Some(value) => value,
            None if selector.optional.unwrap_or(false) => return Ok(None),
            None => {
                return Err(ProviderError::validation(format!(
                    "env {}: key {} of config map {map_name:?} not found",
                    env.name, selector.key
                )))
            }
        };
        return Ok((!value.is_empty()).then(|| aci::EnvironmentVariable::plain(&env.name, value)));
    }

    Ok(None)
}

/// Copy of the provider diagnostics for one pod
///
/// ContainerInsights workspaces tag each pod's logs with its uid.
fn diagnostics_for(diagnostics: Option<&aci::Diagnostics>, uid: Option<&str>) -> Option<aci::Diagnostics> {
    let mut diagnostics = diagnostics?.clone();
    if diagnostics.log_analytics.log_type.as_deref() == Some(aci::LOG_TYPE_CONTAINER_INSIGHTS) {
        diagnostics.log_analytics.metadata.insert(
            aci::metadata::POD_UUID.to_string(),
            uid.unwrap_or_default().to_string(),
        );
    }
    Some(diagnostics)
}
