use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::info;

/// Build a client from an explicit kubeconfig, or in-cluster / default config
///
/// `master` overrides the API server address either way.
pub async fn init_kube_client(kubeconfig: Option<&Path>, master: Option<&str>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig file: {}", path.display()))?;

            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| {
                    format!("Failed to create config from kubeconfig: {}", path.display())
                })?
        }
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes client configuration")?,
    };

    if let Some(master) = master.filter(|m| !m.is_empty()) {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("Invalid API server address: {}", master))?;
    }

    info!(cluster_url = %config.cluster_url, "Kubernetes client configured");
    Client::try_from(config).context("Failed to create Kubernetes client")
}
