//! Backend gateway
//!
//! The provider talks to the container group backend only through
//! [`ContainerGroupGateway`]. [`RestGateway`] is the HTTP implementation;
//! tests substitute in-memory fakes.

pub mod rest;

pub use rest::{RestConfig, RestGateway};

use crate::aci;
use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single gateway call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("resource not found")]
    NotFound,

    #[error("backend returned status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

/// Options for a container log read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Only return the last N lines
    pub tail: Option<u32>,
    pub timestamps: bool,
}

/// Container group operations of the backend
///
/// Group names are `"{namespace}-{name}"`, scoped to the configured
/// resource group.
#[async_trait]
pub trait ContainerGroupGateway: Send + Sync {
    /// Create or replace a container group
    async fn create_group(
        &self,
        name: &str,
        group: &aci::ContainerGroup,
    ) -> Result<aci::ContainerGroup, GatewayError>;

    /// Read a snapshot; `GatewayError::NotFound` when the group does not exist
    async fn get_group(&self, name: &str) -> Result<aci::ContainerGroup, GatewayError>;

    /// All container groups in the resource group
    async fn list_groups(&self) -> Result<Vec<aci::ContainerGroup>, GatewayError>;

    async fn delete_group(&self, name: &str) -> Result<(), GatewayError>;

    /// Open an exec session; returns the stream address and its one-time token
    async fn exec_command(
        &self,
        group: &str,
        container: &str,
        request: &aci::ExecRequest,
    ) -> Result<aci::ExecResponse, GatewayError>;

    async fn container_logs(
        &self,
        group: &str,
        container: &str,
        options: &LogOptions,
    ) -> Result<String, GatewayError>;

    /// Capabilities offered in a region, used for GPU SKU discovery
    async fn list_capabilities(&self, region: &str) -> Result<Vec<aci::Capability>, GatewayError>;
}
