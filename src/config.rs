use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::Backoff;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Supports ${ALLOWED_ROOT} substitution
    #[serde(default = "default_allowed_root")]
    pub allowed_root: PathBuf,
    /// Executable base names (matched case-insensitively, exact or prefix)
    #[serde(default = "default_allowed_executables")]
    pub allowed_executables: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Maximum number of subprocesses running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Per-attempt HTTP timeout; must outlive the longest remote execution
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Extra attempts after the first failed probe
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Run one readiness check before serving and exit if it fails
    #[serde(default)]
    pub validate_on_startup: bool,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DependencyConfig {
    pub name: String,
    /// Base URL; empty means the dependency is not configured.
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_allowed_root() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_allowed_executables() -> Vec<String> {
    ["pytest", "npm", "cargo", "go", "python", "node"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_min_delay_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    360
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_probe_retries() -> u32 {
    2
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_required() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_root: default_allowed_root(),
            allowed_executables: default_allowed_executables(),
            default_timeout_secs: default_timeout_secs(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            min_delay_ms: default_min_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_retries: default_probe_retries(),
            probe_interval_ms: default_probe_interval_ms(),
            validate_on_startup: false,
            dependencies: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Socket address string for the listener, e.g. "0.0.0.0:8080"
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            Duration::from_millis(self.min_delay_ms),
        )
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses configuration text after expanding `${VAR}` and `${VAR:-default}`
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sandbox.default_timeout_secs == 0 {
            anyhow::bail!("sandbox.default_timeout_secs must be positive");
        }
        if self.sandbox.max_concurrent == 0 {
            anyhow::bail!("sandbox.max_concurrent must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for dep in &self.health.dependencies {
            if dep.name.trim().is_empty() {
                anyhow::bail!("health.dependencies entries need a name");
            }
            if !seen.insert(dep.name.as_str()) {
                anyhow::bail!("dependency '{}' is listed twice", dep.name);
            }
            if dep.name == "ready" {
                anyhow::bail!("dependency name 'ready' is reserved");
            }
            if !dep.url.trim().is_empty() {
                url::Url::parse(dep.url.trim())
                    .map_err(|e| anyhow::anyhow!("invalid URL for dependency '{}': {e}", dep.name))?;
            }
        }
        Ok(())
    }
}
