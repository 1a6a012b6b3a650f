//! Dependency readiness.
//!
//! Every configured dependency is probed concurrently. A probe gets a fixed
//! timeout per attempt and a small fixed number of retries separated by a
//! constant interval; health checks are plain GETs, so the exponential
//! policy of the resilient client is not needed here.
//!
//! Readiness policy: a dependency with no URL reports `not_configured`.
//! `ready` is the AND over dependencies marked `required` (the default);
//! optional dependencies are reported but never change the verdict.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{DependencyConfig, HealthConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    Timeout,
    ConnectionError,
    NotConfigured,
    Error,
}

impl HealthStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Aggregate verdict returned by `GET /readyz`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(flatten)]
    pub dependencies: BTreeMap<String, HealthStatus>,
}

/// A single reachability check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

/// `GET <url><path>`; any 2xx is healthy.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(client: Client, base_url: &str, path: &str) -> Self {
        let path = if path.starts_with('/') || path.is_empty() {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Self {
            client,
            url: format!("{}{path}", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> HealthStatus {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => HealthStatus::Ok,
            Ok(response) => {
                debug!("Probe {} returned {}", self.url, response.status());
                HealthStatus::ConnectionError
            }
            Err(e) if e.is_timeout() => HealthStatus::Timeout,
            Err(e) if e.is_connect() || e.is_request() => HealthStatus::ConnectionError,
            Err(e) => {
                debug!("Probe {} failed: {e}", self.url);
                HealthStatus::Error
            }
        }
    }
}

pub struct Dependency {
    pub name: String,
    pub required: bool,
    /// `None` when no address is configured
    pub probe: Option<Box<dyn HealthProbe>>,
}

pub struct HealthAggregator {
    dependencies: Vec<Dependency>,
    probe_timeout: Duration,
    retries: u32,
    retry_interval: Duration,
}

impl HealthAggregator {
    pub fn new(
        dependencies: Vec<Dependency>,
        probe_timeout: Duration,
        retries: u32,
        retry_interval: Duration,
    ) -> Self {
        Self {
            dependencies,
            probe_timeout,
            retries,
            retry_interval,
        }
    }

    pub fn from_config(config: &HealthConfig) -> anyhow::Result<Self> {
        let probe_timeout = Duration::from_secs(config.probe_timeout_secs);
        let client = Client::builder().timeout(probe_timeout).build()?;
        let dependencies = config
            .dependencies
            .iter()
            .map(|dep| Self::dependency_from_config(&client, dep))
            .collect();

        Ok(Self::new(
            dependencies,
            probe_timeout,
            config.probe_retries,
            Duration::from_millis(config.probe_interval_ms),
        ))
    }

    fn dependency_from_config(client: &Client, dep: &DependencyConfig) -> Dependency {
        let url = dep.url.trim();
        let probe = (!url.is_empty())
            .then(|| Box::new(HttpProbe::new(client.clone(), url, &dep.path)) as Box<dyn HealthProbe>);
        Dependency {
            name: dep.name.clone(),
            required: dep.required,
            probe,
        }
    }

    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(|d| d.name.as_str())
    }

    /// Probes every dependency concurrently and folds the results.
    pub async fn check_readiness(&self) -> Readiness {
        let statuses = join_all(self.dependencies.iter().map(|dep| self.probe(dep))).await;

        let ready = self
            .dependencies
            .iter()
            .zip(&statuses)
            .filter(|(dep, _)| dep.required)
            .all(|(_, status)| status.is_ok());

        let dependencies = self
            .dependencies
            .iter()
            .map(|dep| dep.name.clone())
            .zip(statuses)
            .collect();

        Readiness {
            ready,
            dependencies,
        }
    }

    async fn probe(&self, dep: &Dependency) -> HealthStatus {
        let Some(probe) = &dep.probe else {
            return HealthStatus::NotConfigured;
        };

        let attempts = self.retries + 1;
        let mut status = HealthStatus::Error;
        for attempt in 1..=attempts {
            status = tokio::time::timeout(self.probe_timeout, probe.check())
                .await
                .unwrap_or(HealthStatus::Timeout);
            if status.is_ok() {
                break;
            }
            debug!(
                dependency = %dep.name,
                attempt,
                ?status,
                "Health probe failed"
            );
            if attempt < attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }

        if !status.is_ok() {
            warn!(dependency = %dep.name, ?status, "Dependency not healthy");
        }
        status
    }
}

/// Logs the verdict, one line per dependency.
pub fn log_readiness(readiness: &Readiness) {
    for (name, status) in &readiness.dependencies {
        info!("  {name}: {status:?}");
    }
    info!("Ready: {}", readiness.ready);
}
