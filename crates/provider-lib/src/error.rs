//! Error taxonomy for the provider

use crate::gateway::GatewayError;
use thiserror::Error;

/// Errors surfaced by the translation engine and the provider façade
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The pod cannot be expressed as a container group; never retried
    #[error("invalid pod spec: {0}")]
    Validation(String),

    /// A snapshot returned by the backend is missing required fields
    #[error("malformed container group: {0}")]
    Translation(String),

    /// The container group does not exist in the backend
    #[error("container group {0} not found")]
    NotFound(String),

    /// A single backend call failed; safe to retry on the next cycle
    #[error("backend request failed: {0}")]
    Backend(String),

    /// Startup configuration is missing or unsupported
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl ProviderError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::Translation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Map a gateway failure for the named container group
    pub fn from_gateway(group: &str, err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound => Self::NotFound(group.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_not_found_maps_to_not_found() {
        let err = ProviderError::from_gateway("default-web", GatewayError::NotFound);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "container group default-web not found");
    }

    #[test]
    fn test_gateway_http_error_is_transient() {
        let err = ProviderError::from_gateway(
            "default-web",
            GatewayError::Http {
                status: 503,
                body: "busy".to_string(),
            },
        );
        assert!(matches!(err, ProviderError::Backend(_)));
        assert!(!err.is_not_found());
    }
}
