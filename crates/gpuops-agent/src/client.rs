//! HTTP client for the controller.

use std::time::Duration;

use gpuops_core::{ActionsResponse, MetricReport};
use thiserror::Error;

const AGENT_TOKEN_HEADER: &str = "X-Agent-Token";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
}

/// Authenticated controller client with per-call deadlines.
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    agent_token: String,
    node_id: String,
}

impl ControllerClient {
    pub fn new(base_url: &str, agent_token: &str, node_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_token: agent_token.to_string(),
            node_id: node_id.to_string(),
        }
    }

    /// Upload one metric report; the response carries the actions to run.
    pub async fn report(
        &self,
        report: &MetricReport,
        timeout: Duration,
    ) -> Result<ActionsResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/metrics", self.base_url))
            .header(AGENT_TOKEN_HEADER, &self.agent_token)
            .timeout(timeout)
            .json(report)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Poll the operator-action outbox.
    pub async fn fetch_actions(&self, timeout: Duration) -> Result<ActionsResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/node/actions", self.base_url))
            .query(&[("node_id", self.node_id.as_str())])
            .header(AGENT_TOKEN_HEADER, &self.agent_token)
            .timeout(timeout)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse(response: reqwest::Response) -> Result<ActionsResponse, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}
