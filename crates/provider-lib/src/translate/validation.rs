//! Structural checks on backend snapshots

use crate::aci;
use crate::error::{ProviderError, Result};
use crate::models::tags;

/// Check that a snapshot carries everything status translation reads
pub fn validate_container_group(group: &aci::ContainerGroup) -> Result<()> {
    let name = group
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ProviderError::translation("container group has no name"))?;

    let props = group
        .properties
        .as_ref()
        .ok_or_else(|| ProviderError::translation(format!("{name}: properties are missing")))?;

    if props.provisioning_state.as_deref().unwrap_or_default().is_empty() {
        return Err(ProviderError::translation(format!(
            "{name}: provisioning state is missing"
        )));
    }

    for tag in [tags::POD_NAME, tags::NAMESPACE] {
        if group.tag(tag).unwrap_or_default().is_empty() {
            return Err(ProviderError::translation(format!("{name}: tag {tag} is missing")));
        }
    }

    for container in &props.containers {
        if container.name.is_empty() {
            return Err(ProviderError::translation(format!(
                "{name}: container without a name"
            )));
        }
        if container.properties.image.is_empty() {
            return Err(ProviderError::translation(format!(
                "{name}: container {} has no image",
                container.name
            )));
        }
    }

    Ok(())
}
