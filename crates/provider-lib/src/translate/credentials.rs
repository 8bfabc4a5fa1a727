//! Image registry credentials from pull secrets

use super::{secret_value, ReferencedResources};
use crate::aci::ImageRegistryCredential;
use crate::error::{ProviderError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{PodSpec, Secret};
use serde::Deserialize;
use std::collections::BTreeMap;

pub const SECRET_TYPE_DOCKERCFG: &str = "kubernetes.io/dockercfg";
pub const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";
pub const DOCKERCFG_KEY: &str = ".dockercfg";
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// One registry entry in either secret format
#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
}

#[derive(Debug, Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

/// Collect credentials for every pull secret referenced by the pod
pub fn image_registry_credentials(
    spec: &PodSpec,
    resources: &ReferencedResources,
) -> Result<Vec<ImageRegistryCredential>> {
    let mut credentials = Vec::new();

    for reference in spec.image_pull_secrets.iter().flatten() {
        let name = reference.name.as_deref().unwrap_or_default();
        let secret = resources.secret(name).ok_or_else(|| {
            ProviderError::validation(format!("image pull secret {name:?} not found"))
        })?;
        credentials.extend(credentials_from_secret(secret)?);
    }

    Ok(credentials)
}

/// Decode the registry credentials held by one pull secret
pub fn credentials_from_secret(secret: &Secret) -> Result<Vec<ImageRegistryCredential>> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();

    let entries = match secret.type_.as_deref() {
        Some(SECRET_TYPE_DOCKERCFG) => {
            let data = secret_value(secret, DOCKERCFG_KEY).ok_or_else(|| {
                ProviderError::validation(format!("no {DOCKERCFG_KEY} present in secret {name:?}"))
            })?;
            serde_json::from_slice::<BTreeMap<String, AuthEntry>>(&data).map_err(|e| {
                ProviderError::validation(format!("malformed {DOCKERCFG_KEY} in secret {name:?}: {e}"))
            })?
        }
        Some(SECRET_TYPE_DOCKER_CONFIG_JSON) => {
            let data = secret_value(secret, DOCKER_CONFIG_JSON_KEY).ok_or_else(|| {
                ProviderError::validation(format!(
                    "no {DOCKER_CONFIG_JSON_KEY} present in secret {name:?}"
                ))
            })?;
            let config: DockerConfigJson = serde_json::from_slice(&data).map_err(|e| {
                ProviderError::validation(format!(
                    "malformed {DOCKER_CONFIG_JSON_KEY} in secret {name:?}: {e}"
                ))
            })?;
            if config.auths.is_empty() {
                return Err(ProviderError::validation(format!(
                    "malformed {DOCKER_CONFIG_JSON_KEY} in secret {name:?}: no auths"
                )));
            }
            config.auths
        }
        other => {
            return Err(ProviderError::validation(format!(
                "image pull secret {name:?} has type {other:?}, expected one of {SECRET_TYPE_DOCKERCFG} or {SECRET_TYPE_DOCKER_CONFIG_JSON}"
            )))
        }
    };

    entries
        .into_iter()
        .map(|(server, entry)| credential_from_entry(server, entry))
        .collect()
}

fn credential_from_entry(server: String, entry: AuthEntry) -> Result<ImageRegistryCredential> {
    if !entry.username.is_empty() {
        return Ok(ImageRegistryCredential {
            server,
            username: entry.username,
            password: Some(entry.password),
        });
    }

    if entry.auth.is_empty() {
        return Err(ProviderError::validation(format!(
            "no username present in auth config for server {server}"
        )));
    }

    let decoded = STANDARD.decode(entry.auth.as_bytes()).map_err(|e| {
        ProviderError::validation(format!("error decoding the auth for server {server}: {e}"))
    })?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| ProviderError::validation(format!("malformed auth for server {server}")))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| ProviderError::validation(format!("malformed auth for server {server}")))?;

    Ok(ImageRegistryCredential {
        server,
        username: username.to_string(),
        password: Some(password.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::LocalObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn secret(name: &str, type_: &str, key: &str, data: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some(type_.to_string()),
            data: Some(BTreeMap::from([(
                key.to_string(),
                ByteString(data.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    fn spec_with_pull_secret(name: &str) -> PodSpec {
        PodSpec {
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: Some(name.to_string()),
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_dockercfg_with_username() {
        let s = secret(
            "reg",
            SECRET_TYPE_DOCKERCFG,
            DOCKERCFG_KEY,
            r#"{"registry.example.com": {"username": "bob", "password": "hunter2"}}"#,
        );

        let creds = credentials_from_secret(&s).unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].server, "registry.example.com");
        assert_eq!(creds[0].username, "bob");
        assert_eq!(creds[0].password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_dockercfg_decodes_auth_field() {
        let auth = STANDARD.encode("alice:s3cret");
        let s = secret(
            "reg",
            SECRET_TYPE_DOCKERCFG,
            DOCKERCFG_KEY,
            &format!(r#"{{"r.io": {{"auth": "{auth}"}}}}"#),
        );

        let creds = credentials_from_secret(&s).unwrap();
        assert_eq!(creds[0].username, "alice");
        assert_eq!(creds[0].password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_dockercfg_malformed_base64_fails() {
        let s = secret(
            "reg",
            SECRET_TYPE_DOCKERCFG,
            DOCKERCFG_KEY,
            r#"{"r.io": {"auth": "%%%not-base64%%%"}}"#,
        );
        assert!(matches!(
            credentials_from_secret(&s),
            Err(ProviderError::Validation(_))
        ));
    }

    #[test]
    fn test_docker_config_json_multi_registry() {
        let s = secret(
            "reg",
            SECRET_TYPE_DOCKER_CONFIG_JSON,
            DOCKER_CONFIG_JSON_KEY,
            r#"{"auths": {
                "a.io": {"username": "u1", "password": "p1"},
                "b.io": {"username": "u2", "password": "p2"}
            }}"#,
        );

        let creds = credentials_from_secret(&s).unwrap();
        let servers: Vec<_> = creds.iter().map(|c| c.server.as_str()).collect();
        assert_eq!(servers, vec!["a.io", "b.io"]);
    }

    #[test]
    fn test_docker_config_json_malformed_json_fails() {
        let s = secret(
            "reg",
            SECRET_TYPE_DOCKER_CONFIG_JSON,
            DOCKER_CONFIG_JSON_KEY,
            "{not json",
        );
        assert!(matches!(
            credentials_from_secret(&s),
            Err(ProviderError::Validation(_))
        ));
    }

    #[test]
    fn test_docker_config_json_without_auths_fails() {
        let s = secret(
            "reg",
            SECRET_TYPE_DOCKER_CONFIG_JSON,
            DOCKER_CONFIG_JSON_KEY,
            r#"{"auths": {}}"#,
        );
        assert!(credentials_from_secret(&s).is_err());
    }

    #[test]
    fn test_unsupported_secret_type_fails() {
        let s = secret("reg", "Opaque", "token", "abc");
        assert!(matches!(
            credentials_from_secret(&s),
            Err(ProviderError::Validation(_))
        ));
    }

    #[test]
    fn test_missing_pull_secret_fails() {
        let spec = spec_with_pull_secret("absent");
        let err = image_registry_credentials(&spec, &ReferencedResources::default()).unwrap_err();
        assert!(err.to_string().contains("absent"));
    }

    #[test]
    fn test_pull_secret_resolved_from_resources() {
        let spec = spec_with_pull_secret("reg");
        let resources = ReferencedResources::default().with_secret(secret(
            "reg",
            SECRET_TYPE_DOCKERCFG,
            DOCKERCFG_KEY,
            r#"{"r.io": {"username": "bob", "password": "pw"}}"#,
        ));

        let creds = image_registry_credentials(&spec, &resources).unwrap();
        assert_eq!(creds.len(), 1);
    }
}
