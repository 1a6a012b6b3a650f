//! Policy-gated command execution.
//!
//! This is not an isolation layer (no namespaces, cgroups or snapshots).
//! Requests are gated by two checks before anything is spawned:
//!
//! 1. The target directory (and any working-directory override) must
//!    resolve inside the configured allowed root
//! 2. The executable base name must match the allowlist
//!
//! Approved commands run through the engine with a hard timeout.

pub mod engine;
pub mod policy;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::correlation::CorrelationId;
use crate::error::RunnerError;

pub use engine::TIMEOUT_EXIT_CODE;
pub use policy::Policy;

/// Body of `POST /execute`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    #[serde(alias = "project_path")]
    pub target_directory: PathBuf,
    pub command: Vec<String>,
    #[serde(default, alias = "cwd", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, alias = "env", skip_serializing_if = "Option::is_none")]
    pub environment_overrides: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ExecuteRequest {
    pub fn new(target_directory: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            target_directory: target_directory.into(),
            command,
            working_directory: None,
            environment_overrides: None,
            timeout_seconds: None,
        }
    }
}

/// Outcome of one execution. `exit_code == TIMEOUT_EXIT_CODE` means the
/// process was killed on timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
}

impl ExecutionResult {
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short human-readable summary, e.g. for CLI output.
    pub fn summary(&self) -> String {
        let stdout = self.stdout.trim();
        if self.success() {
            let text = if stdout.is_empty() { "Tests passed." } else { stdout };
            format!("Exit code: 0. {text} (duration: {}s)", self.duration_seconds)
        } else if self.timed_out() {
            format!("Timed out after {}s.", self.duration_seconds)
        } else {
            let stderr = self.stderr.trim();
            let text = [stderr, stdout]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or("No output");
            format!(
                "Exit code: {}. stderr: {text} (duration: {}s)",
                self.exit_code, self.duration_seconds
            )
        }
    }
}

/// Validates and runs execution requests.
///
/// Holds only immutable policy and the concurrency limit; requests share
/// nothing else.
pub struct ExecutionService {
    policy: Policy,
    default_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ExecutionService {
    pub fn new(policy: Policy, default_timeout: Duration, max_concurrent: usize) -> Self {
        Self {
            policy,
            default_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            Policy::from_config(config)?,
            Duration::from_secs(config.default_timeout_secs),
            config.max_concurrent,
        ))
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        correlation_id: &CorrelationId,
    ) -> Result<ExecutionResult, RunnerError> {
        let timeout = match request.timeout_seconds {
            Some(0) => {
                return Err(RunnerError::invalid_input("timeout_seconds must be positive"))
            }
            Some(secs) => Duration::from_secs(secs),
            None => self.default_timeout,
        };

        let target = self
            .policy
            .validate(&request.target_directory, &request.command)
            .inspect_err(|e| warn!(%correlation_id, "Request rejected: {e}"))?;

        let working_dir = match &request.working_directory {
            Some(dir) => self.resolve_working_directory(&target, dir)?,
            None => target,
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| anyhow::anyhow!("execution permits closed: {e}"))?;

        info!(
            %correlation_id,
            program = %request.command[0],
            args = request.command.len() - 1,
            timeout_secs = timeout.as_secs(),
            "Executing command"
        );
        debug!(%correlation_id, "Working directory: {}", working_dir.display());

        let env = request.environment_overrides.unwrap_or_default();
        engine::run(&working_dir, &request.command, &env, timeout).await
    }

    /// Working-directory overrides are held to the same containment rule;
    /// relative overrides are taken relative to the target directory.
    fn resolve_working_directory(&self, target: &Path, dir: &Path) -> Result<PathBuf, RunnerError> {
        let candidate = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            target.join(dir)
        };
        self.policy.check_directory(&candidate).map_err(|_| {
            RunnerError::invalid_input("working directory must be an existing directory under the allowed root")
        })
    }
}
