//! Provider library for running orchestrator pods on container instances
//!
//! This crate provides the core functionality for:
//! - Translating pod specs into container group requests and back
//! - Tracking backend status and reporting changes to the orchestrator
//! - Talking to the container group management API
//! - Exec session proxying
//! - Health checks and observability

pub mod aci;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod health;
pub mod models;
pub mod node;
pub mod observability;
pub mod provider;
pub mod settings;
pub mod tracker;
pub mod translate;

pub use error::{ProviderError, Result};
pub use gateway::{ContainerGroupGateway, GatewayError, LogOptions, RestConfig, RestGateway};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{ProviderMetrics, StructuredLogger};
pub use provider::{AciProvider, ResourceLookup};
pub use settings::{DiagnosticsSources, ProviderSettings};
pub use tracker::{ActiveUnitSource, PodTracker, StatusNotifier, StatusSource, TrackerConfig};
