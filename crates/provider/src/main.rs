//! ACI provider - runs the pods of a virtual node as container groups
//!
//! Registers the virtual node, submits pods scheduled on it and reports
//! their backend status back to the cluster.

use anyhow::{Context, Result};
use provider_lib::{
    AciProvider, Component, DiagnosticsSources, HealthRegistry, ProviderMetrics, RestGateway,
    StructuredLogger,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod controller;
mod kube_source;

use controller::PodController;
use kube_source::KubeOrchestrator;

const PROVIDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting aci-provider");

    let config = config::ProviderConfig::load()?;
    let settings = config.provider_settings(&DiagnosticsSources::from_env())?;
    info!(node_name = %settings.node_name, region = %settings.region, "Provider configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(Component::Tracker).await;
    health_registry.register(Component::Gateway).await;
    health_registry.register(Component::Orchestrator).await;

    let metrics = ProviderMetrics::new();
    let logger = StructuredLogger::new(settings.node_name.clone());
    logger.log_startup(PROVIDER_VERSION, &settings.region, &settings.resource_group);

    let cancel = CancellationToken::new();

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, cancel.clone()));

    let client = kube::Client::try_default()
        .await
        .context("failed to create cluster client")?;
    let orchestrator = Arc::new(KubeOrchestrator::new(client.clone(), settings.node_name.clone()));
    let gateway = Arc::new(RestGateway::new(config.rest_config())?);

    let provider = Arc::new(
        AciProvider::connect(gateway, orchestrator.clone(), settings)
            .await
            .with_health(health_registry.clone()),
    );

    controller::register_node(&client, &provider)
        .await
        .context("failed to register node")?;

    let tracker_handle = provider.start_tracking(
        orchestrator.clone(),
        orchestrator.clone(),
        config.tracker_config(),
        cancel.clone(),
    )?;

    let pod_controller = PodController::new(
        provider.clone(),
        orchestrator.clone(),
        orchestrator.clone(),
        health_registry.clone(),
        config.sync_interval(),
    );
    let controller_handle = tokio::spawn(pod_controller.run(cancel.clone()));
    let heartbeat_handle = tokio::spawn(controller::run_heartbeat(
        client,
        provider.clone(),
        health_registry.clone(),
        config.sync_interval(),
        cancel.clone(),
    ));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    cancel.cancel();

    for (name, handle) in [
        ("tracker", tracker_handle),
        ("controller", controller_handle),
        ("heartbeat", heartbeat_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task ended abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutting down");
    Ok(())
}
