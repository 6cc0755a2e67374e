//! Client for the remote automation worker that learns and replays recipes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::context::AutomationContext;
use super::steps::Recipe;
use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum RemoteJobError {
    #[error("remote automation worker is not configured")]
    NotConfigured,
    #[error("remote worker request failed: {0}")]
    Request(String),
    #[error("remote worker returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("remote worker response was invalid: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnJobRequest {
    pub issuer_id: String,
    pub issuer_name: String,
    pub challenge_url: Option<String>,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunJobRequest {
    pub issuer_id: String,
    pub challenge_id: Uuid,
    pub recipe: Recipe,
    pub context: AutomationContext,
    pub callback_url: Option<String>,
}

#[async_trait]
pub trait RemoteJobClient: Send + Sync + 'static {
    /// Returns the remote job id.
    async fn start_learn_job(&self, request: &LearnJobRequest) -> Result<String, RemoteJobError>;

    /// Returns the remote job id.
    async fn start_run_job(&self, request: &RunJobRequest) -> Result<String, RemoteJobError>;
}

pub struct HttpRemoteJobClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct JobAccepted {
    #[serde(alias = "jobId", alias = "id")]
    job_id: String,
}

impl HttpRemoteJobClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            token,
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<String, RemoteJobError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RemoteJobError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%url, %status, "remote worker rejected job");
            return Err(RemoteJobError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let accepted: JobAccepted = response
            .json()
            .await
            .map_err(|err| RemoteJobError::InvalidResponse(err.to_string()))?;
        if accepted.job_id.trim().is_empty() {
            return Err(RemoteJobError::InvalidResponse("empty job id".into()));
        }
        Ok(accepted.job_id)
    }
}

#[async_trait]
impl RemoteJobClient for HttpRemoteJobClient {
    async fn start_learn_job(&self, request: &LearnJobRequest) -> Result<String, RemoteJobError> {
        let job_id = self.post("jobs/learn", request).await?;
        info!(issuer_id = %request.issuer_id, %job_id, "learn job started");
        Ok(job_id)
    }

    async fn start_run_job(&self, request: &RunJobRequest) -> Result<String, RemoteJobError> {
        let job_id = self.post("jobs/run", request).await?;
        info!(
            issuer_id = %request.issuer_id,
            challenge_id = %request.challenge_id,
            %job_id,
            "run job started"
        );
        Ok(job_id)
    }
}

/// Stand-in used when no worker URL is configured.
pub struct DisabledRemoteJobs;

#[async_trait]
impl RemoteJobClient for DisabledRemoteJobs {
    async fn start_learn_job(&self, _request: &LearnJobRequest) -> Result<String, RemoteJobError> {
        Err(RemoteJobError::NotConfigured)
    }

    async fn start_run_job(&self, _request: &RunJobRequest) -> Result<String, RemoteJobError> {
        Err(RemoteJobError::NotConfigured)
    }
}

pub fn remote_jobs_from_config(config: &AppConfig) -> Arc<dyn RemoteJobClient> {
    match &config.automation_worker_url {
        Some(url) => Arc::new(HttpRemoteJobClient::new(
            url.clone(),
            config.automation_worker_token.clone(),
        )),
        None => Arc::new(DisabledRemoteJobs),
    }
}
