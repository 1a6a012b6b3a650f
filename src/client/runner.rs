//! Typed HTTP client for a remote runner's execute and liveness endpoints.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{ClientError, RetryPolicy};
use crate::config::RetryConfig;
use crate::correlation::{CorrelationId, CORRELATION_HEADER};
use crate::sandbox::{ExecuteRequest, ExecutionResult};

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// User-Agent header sent with requests.
const USER_AGENT: &str = concat!("sandbox-runner/", env!("CARGO_PKG_VERSION"));

pub struct RunnerClient {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl RunnerClient {
    pub fn new(base_url: &str, retry: RetryPolicy, request_timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("Invalid runner URL '{base_url}': {e}"))?;
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url,
            retry,
        })
    }

    pub fn from_config(base_url: &str, config: &RetryConfig) -> anyhow::Result<Self> {
        Self::new(
            base_url,
            RetryPolicy::from_config(config),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Runs a command remotely. Transient failures are retried under the
    /// client's policy with one correlation id for every attempt.
    ///
    /// The remote command may run more than once, so only send commands
    /// that are safe to repeat.
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        correlation_id: CorrelationId,
    ) -> Result<ExecutionResult, ClientError> {
        let url = self.endpoint("execute")?;
        self.retry
            .call(
                correlation_id,
                |ctx| {
                    debug!(
                        correlation_id = %ctx.correlation_id,
                        attempt = ctx.attempt,
                        "POST {url}"
                    );
                    let send = self
                        .client
                        .post(url.clone())
                        .header(CORRELATION_HEADER, ctx.correlation_id.as_str())
                        .json(request)
                        .send();
                    async move { read_json(send.await?).await }
                },
                ClientError::is_retriable,
            )
            .await
    }

    /// Liveness of the remote runner.
    pub async fn health(&self, correlation_id: CorrelationId) -> Result<(), ClientError> {
        let url = self.endpoint("health")?;
        self.retry
            .call(
                correlation_id,
                |ctx| {
                    let send = self
                        .client
                        .get(url.clone())
                        .header(CORRELATION_HEADER, ctx.correlation_id.as_str())
                        .send();
                    async move {
                        let _: serde_json::Value = read_json(send.await?).await?;
                        Ok(())
                    }
                },
                ClientError::is_retriable,
            )
            .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let base = format!("{}/", self.base_url.as_str().trim_end_matches('/'));
        Url::parse(&base)
            .and_then(|u| u.join(path))
            .map_err(|e| ClientError::Request(e.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_else(|e| {
            debug!("Failed to read error body for {status}: {e}");
            String::new()
        });
        return Err(ClientError::from_status(status, body));
    }
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}
