//! Exporter configuration
//!
//! Settings are layered: built-in defaults, an optional config file,
//! `EXPORTER_*` environment variables, then command-line flags.

use anyhow::{Context, Result};
use clap::Parser;
use exporter_lib::reconciler::ReconcilerConfig;
use exporter_lib::topology::TopologyConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "EXPORTER";

/// Command-line flags; anything set here overrides the config layers
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "resource-exporter")]
#[command(
    author,
    version,
    about = "Publishes node NUMA topology for NUMA-aware scheduling",
    long_about = None
)]
pub struct Cli {
    /// Optional configuration file (YAML, TOML or JSON)
    #[arg(long, env = "EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interval between topology checks (e.g. 3s, 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub check_period: Option<Duration>,

    /// Path to the kubelet configuration file
    #[arg(long)]
    pub kubelet_conf: Option<PathBuf>,

    /// sysfs system devices directory
    #[arg(long)]
    pub device_path: Option<PathBuf>,

    /// Path to the kubelet cpu_manager_state checkpoint
    #[arg(long)]
    pub cpu_manager_state: Option<PathBuf>,

    /// Reserved resources overriding the kubelet configuration (e.g. cpu=200m,memory=500Mi)
    #[arg(long, value_parser = parse_key_value_list)]
    pub res_reserved: Option<BTreeMap<String, String>>,

    /// Kubernetes API server address, overrides the kubeconfig
    #[arg(long)]
    pub master: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Port for the health and metrics server
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Name of the node this exporter runs on
    #[arg(long, env = "MY_NODE_NAME")]
    pub node_name: Option<String>,
}

/// Resolved exporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub node_name: String,

    /// humantime duration text
    #[serde(default = "default_check_period")]
    pub check_period: String,

    #[serde(default = "default_kubelet_conf")]
    pub kubelet_conf: PathBuf,

    #[serde(default = "default_device_path")]
    pub device_path: PathBuf,

    #[serde(default = "default_cpu_manager_state")]
    pub cpu_manager_state: PathBuf,

    /// `name=quantity` pairs, comma separated
    #[serde(default)]
    pub res_reserved: String,

    #[serde(default)]
    pub master: Option<String>,

    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_check_period() -> String {
    "3s".to_string()
}

fn default_kubelet_conf() -> PathBuf {
    PathBuf::from("/var/lib/kubelet/config.yaml")
}

fn default_device_path() -> PathBuf {
    TopologyConfig::default().device_path
}

fn default_cpu_manager_state() -> PathBuf {
    TopologyConfig::default().cpu_manager_state
}

fn default_api_port() -> u16 {
    8080
}

impl ExporterConfig {
    /// Load the config layers and apply command-line overrides
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        let layered = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .context("Failed to load exporter configuration")?;

        let mut config: ExporterConfig = layered
            .try_deserialize()
            .context("Invalid exporter configuration")?;
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(node_name) = &cli.node_name {
            self.node_name = node_name.clone();
        }
        if let Some(period) = cli.check_period {
            self.check_period = humantime::format_duration(period).to_string();
        }
        if let Some(path) = &cli.kubelet_conf {
            self.kubelet_conf = path.clone();
        }
        if let Some(path) = &cli.device_path {
            self.device_path = path.clone();
        }
        if let Some(path) = &cli.cpu_manager_state {
            self.cpu_manager_state = path.clone();
        }
        if let Some(reserved) = &cli.res_reserved {
            self.res_reserved = format_key_value_list(reserved);
        }
        if cli.master.is_some() {
            self.master = cli.master.clone();
        }
        if cli.kubeconfig.is_some() {
            self.kubeconfig = cli.kubeconfig.clone();
        }
        if let Some(port) = cli.api_port {
            self.api_port = port;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("Node name is required: set MY_NODE_NAME or --node-name");
        }
        if self.check_period()?.is_zero() {
            anyhow::bail!("check-period must be greater than zero");
        }
        self.res_reserved()?;
        Ok(())
    }

    pub fn check_period(&self) -> Result<Duration> {
        humantime::parse_duration(&self.check_period)
            .with_context(|| format!("Invalid check-period {:?}", self.check_period))
    }

    pub fn res_reserved(&self) -> Result<BTreeMap<String, String>> {
        parse_key_value_list(&self.res_reserved).map_err(anyhow::Error::msg)
    }

    pub fn reconciler_config(&self) -> Result<ReconcilerConfig> {
        Ok(ReconcilerConfig {
            check_period: self.check_period()?,
            kubelet_conf: self.kubelet_conf.clone(),
            topology: TopologyConfig {
                device_path: self.device_path.clone(),
                cpu_manager_state: self.cpu_manager_state.clone(),
            },
            res_reserved: self.res_reserved()?,
        })
    }
}

/// Parse `cpu=200m,memory=500Mi`
pub fn parse_key_value_list(s: &str) -> Result<BTreeMap<String, String>, String> {
    let mut pairs = BTreeMap::new();

    for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {:?}", item))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in {:?}", item));
        }
        pairs.insert(key.to_string(), value.trim().to_string());
    }

    Ok(pairs)
}

fn format_key_value_list(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
