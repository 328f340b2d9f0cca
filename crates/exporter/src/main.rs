//! Resource Exporter - NUMA topology exporter
//!
//! This binary runs as a DaemonSet on each Kubernetes node, publishing the
//! node's CPU topology and kubelet reservations for NUMA-aware scheduling.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use exporter_lib::{
    health::HealthRegistry,
    machine::{MachineInfo, MachinePaths},
    observability::{ExporterMetrics, StructuredLogger},
    reconciler::ReconcilerBuilder,
    record::KubeRecordStore,
};
use resource_exporter::{
    api, config, kube_client,
    supervisor::{self, StopReason},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = config::Cli::parse();
    let config = config::ExporterConfig::load(&cli)?;
    let reconciler_config = config.reconciler_config()?;
    info!(
        node_name = %config.node_name,
        kubelet_conf = %config.kubelet_conf.display(),
        device_path = %config.device_path.display(),
        "Exporter configured"
    );

    // Capacity is needed to resolve percentage eviction thresholds
    let machine = MachineInfo::load(&MachinePaths::detect())
        .await
        .context("Failed to get machine info")?;

    let client =
        kube_client::init_kube_client(config.kubeconfig.as_deref(), config.master.as_deref())
            .await?;

    let health_registry = HealthRegistry::with_exporter_components().await;
    let metrics = ExporterMetrics::new().context("Failed to register metrics")?;

    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(EXPORTER_VERSION, reconciler_config.check_period);

    let reconciler = ReconcilerBuilder::new()
        .config(reconciler_config)
        .node_name(&config.node_name)
        .capacity(machine.capacity())
        .store(Arc::new(KubeRecordStore::new(client)))
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .build()?;

    let (shutdown_tx, _) = broadcast::channel(1);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));
    let mut reconciler_handle = tokio::spawn(reconciler.run(shutdown_tx.subscribe()));

    let stop = supervisor::wait_for_stop(
        &mut reconciler_handle,
        tokio::signal::ctrl_c(),
        &health_registry,
    )
    .await;

    let result = match stop {
        StopReason::Signal => {
            logger.log_shutdown("SIGINT received");
            let _ = shutdown_tx.send(());
            if let Err(e) = reconciler_handle.await {
                error!(error = %e, "Reconcile loop terminated abnormally");
            }
            Ok(())
        }
        StopReason::LoopExited(reason) => {
            logger.log_shutdown(&reason);
            let _ = shutdown_tx.send(());
            Err(anyhow!(reason))
        }
    };

    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server terminated abnormally"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    result
}
