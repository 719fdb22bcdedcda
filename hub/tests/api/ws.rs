use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flowplane_common::models::conversation::MessageRole;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use uuid::Uuid;

use crate::helpers::{app, user_token, StubRuntime};

async fn connect(
    addr: SocketAddr,
    conversation_id: Uuid,
    token: &str,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    // The token travels in the query string, which the auth layer trusts the
    // same as the Authorization header.
    let url = format!("ws://{addr}/ws/conversations/{conversation_id}?token={token}");

    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket upgrade failed");

    socket
}

async fn next_frame<S>(socket: &mut S) -> Value
where
    S: futures::Stream<
            Item = Result<TungsteniteMessage, tokio_tungstenite::tungstenite::Error>,
        > + Unpin,
{
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .expect("socket errored");

    match message {
        TungsteniteMessage::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn turn_frames_arrive_in_order() {
    let app = app(
        Arc::new(StubRuntime::streaming(&["Hello", " world"])),
        Some("https://agent.run.example.com".to_string()),
    );
    let conversation_id = app.create_conversation(Some(Uuid::new_v4())).await;
    let addr = app.spawn().await;
    let token = user_token(app.owner_id);

    let mut socket = connect(addr, conversation_id, &token).await;

    let response = app
        .post_json(
            &format!("/api/v1/conversations/{conversation_id}/messages"),
            &token,
            json!({"role": "user", "content": "hi"}),
        )
        .await;
    assert_eq!(response.status(), http::StatusCode::CREATED);

    let ack = next_frame(&mut socket).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["role"], "user");
    assert!(ack["message_id"].is_string());

    let first = next_frame(&mut socket).await;
    assert_eq!(first, json!({"type": "stream", "content": "Hello"}));

    let second = next_frame(&mut socket).await;
    assert_eq!(second, json!({"type": "stream", "content": " world"}));

    let complete = next_frame(&mut socket).await;
    assert_eq!(complete, json!({"type": "complete"}));
}

#[tokio::test]
async fn failed_runtime_login_warns_then_completes() {
    let runtime = Arc::new(StubRuntime::streaming(&["never sent"]));
    runtime.fail_login.store(true, Ordering::SeqCst);

    let app = app(runtime, Some("https://agent.run.example.com".to_string()));
    let conversation_id = app.create_conversation(Some(Uuid::new_v4())).await;
    let addr = app.spawn().await;
    let token = user_token(app.owner_id);

    let mut socket = connect(addr, conversation_id, &token).await;

    app.post_json(
        &format!("/api/v1/conversations/{conversation_id}/messages"),
        &token,
        json!({"role": "user", "content": "hi"}),
    )
    .await;

    let ack = next_frame(&mut socket).await;
    assert_eq!(ack["type"], "ack");

    let warn = next_frame(&mut socket).await;
    assert_eq!(warn, json!({"type": "warn", "message": "runtime_auth_failed"}));

    let complete = next_frame(&mut socket).await;
    assert_eq!(complete, json!({"type": "complete"}));
}

#[tokio::test]
async fn unbound_conversation_warns_then_completes() {
    let app = app(
        Arc::new(StubRuntime::streaming(&[])),
        Some("https://agent.run.example.com".to_string()),
    );
    let conversation_id = app.create_conversation(None).await;
    let addr = app.spawn().await;
    let token = user_token(app.owner_id);

    let mut socket = connect(addr, conversation_id, &token).await;

    app.post_json(
        &format!("/api/v1/conversations/{conversation_id}/messages"),
        &token,
        json!({"role": "user", "content": "hi"}),
    )
    .await;

    let ack = next_frame(&mut socket).await;
    assert_eq!(ack["type"], "ack");

    let warn = next_frame(&mut socket).await;
    assert_eq!(warn["message"], "no_agent_bound");

    assert_eq!(next_frame(&mut socket).await["type"], "complete");
}

#[tokio::test]
async fn assembled_reply_is_persisted_as_one_assistant_message() {
    let app = app(
        Arc::new(StubRuntime::streaming(&["Hel", "lo"])),
        Some("https://agent.run.example.com".to_string()),
    );
    let conversation_id = app.create_conversation(Some(Uuid::new_v4())).await;
    let token = user_token(app.owner_id);

    app.post_json(
        &format!("/api/v1/conversations/{conversation_id}/messages"),
        &token,
        json!({"role": "user", "content": "hi"}),
    )
    .await;

    // The turn runs in the background; wait for the finalized message.
    let mut waited = Duration::from_millis(0);
    loop {
        let messages = app.dal.messages(conversation_id);
        if messages.len() == 2 {
            assert_eq!(messages[1].role, MessageRole::Assistant);
            assert_eq!(messages[1].content, "Hello");
            break;
        }

        assert!(waited < Duration::from_secs(5), "assistant reply never persisted");
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
}

#[tokio::test]
async fn websocket_requires_a_valid_token() {
    let app = app(Arc::new(StubRuntime::streaming(&[])), None);
    let conversation_id = app.create_conversation(None).await;
    let addr = app.spawn().await;

    let url = format!("ws://{addr}/ws/conversations/{conversation_id}?token=garbage");
    let result = tokio_tungstenite::connect_async(url).await;

    assert!(result.is_err(), "upgrade must be refused without a valid token");
}
