use std::sync::Arc;

use async_trait::async_trait;
use flowplane_common::backends::client::{ClientError, DeployerApiClient, MachineTokenSource};
use flowplane_common::models::conversation::{MessageRole, WsFrame};
use futures::StreamExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::dal::{Conversation, Dal, Message};
use crate::runtime::AgentRuntime;
use crate::subscribers::SubscriberRegistry;

/// Where the turn runner finds the deployed endpoint of an agent.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn running_endpoint(&self, agent_id: Uuid) -> Result<Option<String>, ClientError>;
}

#[async_trait]
impl EndpointResolver for DeployerApiClient {
    async fn running_endpoint(&self, agent_id: Uuid) -> Result<Option<String>, ClientError> {
        DeployerApiClient::running_endpoint(self, agent_id).await
    }
}

/// Source of the machine token presented to the runtime's login handshake.
#[async_trait]
pub trait ServiceTokens: Send + Sync {
    async fn token(&self) -> Result<String, ClientError>;
}

#[async_trait]
impl ServiceTokens for MachineTokenSource {
    async fn token(&self) -> Result<String, ClientError> {
        MachineTokenSource::token(self).await
    }
}

/// Runs one agent turn: resolve the conversation's deployed endpoint, stream
/// the runtime's output to all subscribers, and persist the assembled reply.
///
/// Frame order within a turn is fixed: the caller broadcasts the `ack`, the
/// runner emits `stream` chunks and closes with `complete` (after a `warn`
/// when the turn failed). Turns of different messages may interleave.
pub struct TurnRunner {
    dal: Arc<dyn Dal>,
    registry: SubscriberRegistry,
    resolver: Arc<dyn EndpointResolver>,
    runtime: Arc<dyn AgentRuntime>,
    tokens: Arc<dyn ServiceTokens>,
    persist_assistant_replies: bool,
}

impl TurnRunner {
    pub fn new(
        dal: Arc<dyn Dal>,
        registry: SubscriberRegistry,
        resolver: Arc<dyn EndpointResolver>,
        runtime: Arc<dyn AgentRuntime>,
        tokens: Arc<dyn ServiceTokens>,
        persist_assistant_replies: bool,
    ) -> Self {
        Self {
            dal,
            registry,
            resolver,
            runtime,
            tokens,
            persist_assistant_replies,
        }
    }

    #[instrument(skip(self, conversation, message), fields(conversation_id = %conversation.id))]
    pub async fn run(&self, conversation: Conversation, message: Message) {
        if let Err(code) = self.try_run(&conversation, &message).await {
            debug!(%code, "agent turn failed");
            self.registry.broadcast(
                conversation.id,
                &WsFrame::Warn {
                    message: code.to_string(),
                },
            );
        }

        self.registry.broadcast(conversation.id, &WsFrame::Complete);
    }

    async fn try_run(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<(), &'static str> {
        let agent_id = conversation.agent_id.ok_or("no_agent_bound")?;

        let endpoint = self
            .resolver
            .running_endpoint(agent_id)
            .await
            .map_err(|err| {
                warn!(error = %err, "failed to look up the agent's deployment");
                "deployment_lookup_failed"
            })?
            .ok_or("no_running_deployment")?;

        let machine_token = self
            .tokens
            .token()
            .await
            .map_err(|_| "runtime_auth_failed")?;
        let bearer = self
            .runtime
            .login(&endpoint, &machine_token)
            .await
            .map_err(|_| "runtime_auth_failed")?;

        let mut chunks = self
            .runtime
            .stream_turn(&endpoint, &bearer, conversation.id, &message.content)
            .await
            .map_err(|_| "runtime_stream_failed")?;

        let mut assembled = String::new();
        while let Some(chunk) = chunks.next().await {
            let content = chunk.map_err(|_| "runtime_stream_failed")?;
            assembled.push_str(&content);
            self.registry
                .broadcast(conversation.id, &WsFrame::Stream { content });
        }

        // The reply is retained as one finalized assistant message.
        if self.persist_assistant_replies && !assembled.is_empty() {
            if let Err(err) = self
                .dal
                .append_message(
                    conversation.id,
                    MessageRole::Assistant,
                    &assembled,
                    serde_json::json!({}),
                )
                .await
            {
                warn!(error = %err, "failed to persist the assistant reply");
            }
        }

        Ok(())
    }
}
