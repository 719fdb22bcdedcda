use std::sync::atomic::Ordering;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use flowplane_common::backends::auth::ensure_owner;
use flowplane_common::claims::Principal;
use flowplane_common::models::conversation::{
    AppendMessageRequest, ConversationResponse, CreateConversationRequest, MessageResponse,
    MessageRole, WsFrame,
};
use flowplane_common::models::error::{ApiError, Error, ErrorKind};
use flowplane_common::models::{Page, Paging};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::dal::Conversation;
use crate::subscribers::SubscriberRegistry;

use super::RouterState;

const READ_ANY: &str = "conversation:read:any";

fn ensure_access(principal: &Principal, conversation: &Conversation) -> Result<(), Error> {
    match conversation.owner_id {
        Some(owner_id) => ensure_owner(principal, owner_id, READ_ANY),
        // Ownerless conversations are service-created; require the grant.
        None => principal.require(READ_ANY).map_err(Error::from),
    }
}

#[instrument(skip(state, principal, request))]
pub(super) async fn create_conversation(
    State(state): State<RouterState>,
    principal: Principal,
    Json(request): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationResponse>), Error> {
    let conversation = state
        .dal
        .create_conversation(
            Some(principal.id),
            request.agent_id,
            request.title,
            request.metadata.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(conversation.into())))
}

#[instrument(skip(state, principal, paging))]
pub(super) async fn list_conversations(
    State(state): State<RouterState>,
    principal: Principal,
    Query(paging): Query<Paging>,
) -> Result<Json<Page<ConversationResponse>>, Error> {
    let owner_scope = if principal.has_permission(READ_ANY) {
        None
    } else {
        Some(principal.id)
    };

    let page = state.dal.list_conversations(owner_scope, &paging).await?;

    Ok(Json(Page {
        items: page.items.into_iter().map(Into::into).collect(),
        page: page.page,
        page_size: page.page_size,
        total: page.total,
    }))
}

#[instrument(skip(state, principal))]
pub(super) async fn get_conversation(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationResponse>, Error> {
    let conversation = state.dal.get_conversation(id).await?;
    ensure_access(&principal, &conversation)?;

    Ok(Json(conversation.into()))
}

/// Append a message to the conversation.
///
/// The message is persisted first, the `ack` goes out to every subscriber,
/// and only then is the agent turn scheduled. Failures of the turn never fail
/// this request.
#[instrument(skip(state, principal, request))]
pub(super) async fn append_message(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(request): Json<AppendMessageRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), Error> {
    if request.content.is_empty() {
        return Err(Error::custom(
            ErrorKind::InvalidInput,
            "message content must not be empty",
        ));
    }

    let conversation = state.dal.get_conversation(id).await?;
    ensure_access(&principal, &conversation)?;

    let message = state
        .dal
        .append_message(
            id,
            request.role,
            &request.content,
            request.metadata.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;

    state.registry.broadcast(
        id,
        &WsFrame::Ack {
            message_id: message.id,
            role: message.role,
        },
    );

    if message.role == MessageRole::User {
        let turns = state.turns.clone();
        let turn_message = message.clone();
        tokio::spawn(async move {
            turns.run(conversation, turn_message).await;
        });
    }

    Ok((StatusCode::CREATED, Json(message.into())))
}

#[instrument(skip(state, principal, paging))]
pub(super) async fn list_messages(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Query(paging): Query<Paging>,
) -> Result<Json<Page<MessageResponse>>, Error> {
    let conversation = state.dal.get_conversation(id).await?;
    ensure_access(&principal, &conversation)?;

    let page = state.dal.list_messages(id, &paging).await?;

    Ok(Json(Page {
        items: page.items.into_iter().map(Into::into).collect(),
        page: page.page,
        page_size: page.page_size,
        total: page.total,
    }))
}

#[instrument(skip(state, principal, ws_upgrade))]
pub(super) async fn conversation_ws(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    ws_upgrade: WebSocketUpgrade,
) -> Result<axum::response::Response, Error> {
    let conversation = state.dal.get_conversation(id).await?;
    ensure_access(&principal, &conversation)?;

    let registry = state.registry.clone();

    Ok(ws_upgrade.on_upgrade(move |socket| conversation_socket(socket, registry, id)))
}

async fn conversation_socket(
    mut socket: WebSocket,
    registry: SubscriberRegistry,
    conversation_id: Uuid,
) {
    let (subscriber_id, mut frames) = registry.subscribe(conversation_id);

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    // Dropped as a slow subscriber.
                    break;
                };
                let Ok(text) = serde_json::to_string(&frame) else {
                    break;
                };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    // Client disconnected?
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    registry.unsubscribe(conversation_id, subscriber_id);
    debug!(%conversation_id, subscriber = %subscriber_id, "subscriber disconnected");
}

pub(super) async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive"}))
}

#[instrument(skip(state))]
pub(super) async fn readiness(State(state): State<RouterState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) && state.dal.healthy().await {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response()
    } else {
        ApiError::new("not ready", StatusCode::SERVICE_UNAVAILABLE).into_response()
    }
}
