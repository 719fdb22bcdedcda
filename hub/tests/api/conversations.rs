use std::sync::Arc;

use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use crate::helpers::{app, body_json, user_token, StubRuntime};

fn quiet_app() -> crate::helpers::TestApp {
    app(Arc::new(StubRuntime::streaming(&[])), None)
}

#[tokio::test]
async fn conversations_are_created_with_an_owner() {
    let app = quiet_app();

    let response = app
        .post_json(
            "/api/v1/conversations",
            &user_token(app.owner_id),
            json!({"title": "support chat"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["title"], "support chat");
    assert_eq!(body["owner_id"].as_str().unwrap(), app.owner_id.to_string());
}

#[tokio::test]
async fn other_users_cannot_read_the_conversation() {
    let app = quiet_app();
    let conversation_id = app.create_conversation(None).await;

    let response = app
        .get(
            &format!("/api/v1/conversations/{conversation_id}"),
            &user_token(Uuid::new_v4()),
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn empty_message_content_is_rejected() {
    let app = quiet_app();
    let conversation_id = app.create_conversation(None).await;

    let response = app
        .post_json(
            &format!("/api/v1/conversations/{conversation_id}/messages"),
            &user_token(app.owner_id),
            json!({"role": "user", "content": ""}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn messages_list_in_total_order() {
    let app = quiet_app();
    let conversation_id = app.create_conversation(None).await;
    let token = user_token(app.owner_id);

    for content in ["one", "two", "three"] {
        // System messages never schedule a turn.
        let response = app
            .post_json(
                &format!("/api/v1/conversations/{conversation_id}/messages"),
                &token,
                json!({"role": "system", "content": content}),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let page = body_json(
        app.get(
            &format!("/api/v1/conversations/{conversation_id}/messages"),
            &token,
        )
        .await,
    )
    .await;

    let contents: Vec<&str> = page["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn listing_is_scoped_to_the_owner() {
    let app = quiet_app();
    app.create_conversation(None).await;

    let own = body_json(
        app.get("/api/v1/conversations", &user_token(app.owner_id))
            .await,
    )
    .await;
    assert_eq!(own["total"], 1);

    let other = body_json(
        app.get("/api/v1/conversations", &user_token(Uuid::new_v4()))
            .await,
    )
    .await;
    assert_eq!(other["total"], 0);
}

#[tokio::test]
async fn messages_in_unknown_conversations_are_not_found() {
    let app = quiet_app();

    let response = app
        .post_json(
            &format!("/api/v1/conversations/{}/messages", Uuid::new_v4()),
            &user_token(app.owner_id),
            json!({"role": "user", "content": "hi"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
