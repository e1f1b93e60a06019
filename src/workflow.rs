use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use reqwest::Client;
use tracing::{error, info};

use crate::{config::Config, error::GenerationError, models::GenerationRequest};

pub type ByteStream = BoxStream<'static, Result<Bytes, GenerationError>>;

/// The remote workflow that turns uploaded images and a prompt into a
/// rendered image, answering with an SSE body.
#[async_trait]
pub trait WorkflowService: Send + Sync {
    /// Dispatches the request and returns the response body once the
    /// service has accepted it.
    async fn stream_run(&self, request: &GenerationRequest) -> Result<ByteStream, GenerationError>;
}

pub struct CozeWorkflowClient {
    client: Client,
    endpoint: String,
    token: String,
    workflow_id: String,
}

impl CozeWorkflowClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self { client: Client::new(), endpoint: endpoint.into(), token: token.into(), workflow_id: workflow_id.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.workflow_api_url.clone(), config.workflow_api_token.clone(), config.workflow_id.clone())
    }
}

#[async_trait]
impl WorkflowService for CozeWorkflowClient {
    async fn stream_run(&self, request: &GenerationRequest) -> Result<ByteStream, GenerationError> {
        info!("🔗 Calling workflow {} at {}", self.workflow_id, self.endpoint);
        let token_preview: String = self.token.chars().take(15).collect();
        info!("🔑 Token: {}... | secret: {}", token_preview, if request.secret().is_empty() { "missing" } else { "provided" });
        info!("📝 Prompt: {} | 🖼️ Images: {:?}", request.prompt(), request.images());

        let response = self.client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&request.payload(&self.workflow_id))
            .send()
            .await
            .map_err(|e| GenerationError::Http(e.to_string()))?;

        let status = response.status();
        info!("📥 Workflow response status: {}", status);
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("❌ Workflow API error response: {}", body);
            return Err(GenerationError::Transport { status: status.as_u16(), body });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GenerationError::Stream(e.to_string())))
            .boxed())
    }
}
