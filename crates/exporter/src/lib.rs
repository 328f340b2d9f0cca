//! Resource exporter process wiring: configuration, Kubernetes client, the
//! health/metrics HTTP API and reconcile loop supervision.

pub mod api;
pub mod config;
pub mod kube_client;
pub mod supervisor;
