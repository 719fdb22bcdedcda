use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime login was refused")]
    AuthFailed,
    #[error("runtime request failed: {0}")]
    Request(String),
    #[error("runtime stream broke: {0}")]
    Stream(String),
}

/// The streaming HTTP interface every deployed agent container exposes.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Login handshake with a control plane machine token; returns the
    /// runtime-scoped bearer.
    async fn login(&self, endpoint: &str, machine_token: &str) -> Result<String, RuntimeError>;

    /// Execute the flow for one user message and stream the emitted chunks.
    async fn stream_turn(
        &self,
        endpoint: &str,
        bearer: &str,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<BoxStream<'static, Result<String, RuntimeError>>, RuntimeError>;
}

#[derive(Deserialize)]
struct RuntimeLogin {
    access_token: String,
}

pub struct HttpAgentRuntime {
    client: reqwest::Client,
}

impl Default for HttpAgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentRuntime {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn login(&self, endpoint: &str, machine_token: &str) -> Result<String, RuntimeError> {
        let response = self
            .client
            .post(format!("{}/api/v1/auth/login", endpoint.trim_end_matches('/')))
            .bearer_auth(machine_token)
            .send()
            .await
            .map_err(|err| RuntimeError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeError::AuthFailed);
        }

        let login: RuntimeLogin = response
            .json()
            .await
            .map_err(|err| RuntimeError::Request(err.to_string()))?;

        Ok(login.access_token)
    }

    async fn stream_turn(
        &self,
        endpoint: &str,
        bearer: &str,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<BoxStream<'static, Result<String, RuntimeError>>, RuntimeError> {
        let response = self
            .client
            .post(format!("{}/api/v1/flow/stream", endpoint.trim_end_matches('/')))
            .bearer_auth(bearer)
            .json(&serde_json::json!({
                "conversation_id": conversation_id,
                "input": content,
            }))
            .send()
            .await
            .map_err(|err| RuntimeError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(RuntimeError::Request(format!(
                "runtime answered {}",
                response.status()
            )));
        }

        let chunks = response
            .bytes_stream()
            .map_err(|err| RuntimeError::Stream(err.to_string()))
            .map(|chunk| chunk.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()));

        Ok(chunks.boxed())
    }
}
