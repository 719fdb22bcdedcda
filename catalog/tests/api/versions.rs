use std::collections::HashSet;

use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::helpers::{app, body_json, user_token};

#[tokio::test]
async fn config_updates_append_increasing_versions() {
    let app = app();
    let created = app.create_agent("bot").await;
    let agent_id = created["agent"]["id"].as_str().unwrap().to_string();
    let token = user_token(app.owner_id);

    for expected in 2..=4 {
        let response = app
            .post_json(
                &format!("/api/v1/agents/{agent_id}/versions"),
                &token,
                json!({"config": {"rev": expected}, "changelog": format!("rev {expected}")}),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["version_number"], expected);
    }

    let latest = body_json(
        app.get(
            &format!("/api/v1/agents/{agent_id}/versions/latest"),
            &token,
        )
        .await,
    )
    .await;
    assert_eq!(latest["version_number"], 4);
    assert_eq!(latest["config"]["rev"], 4);
}

#[tokio::test]
async fn concurrent_updates_keep_version_numbers_gapless() {
    let app = app();
    let created = app.create_agent("busy-bot").await;
    let agent_id = created["agent"]["id"].as_str().unwrap().to_string();

    let mut handles = Vec::new();
    for i in 0..10 {
        let router = app.router.clone();
        let agent_id = agent_id.clone();
        let token = user_token(app.owner_id);
        handles.push(tokio::spawn(async move {
            use tower::ServiceExt;

            let response = router
                .oneshot(
                    http::Request::post(format!("/api/v1/agents/{agent_id}/versions"))
                        .header(http::header::CONTENT_TYPE, "application/json")
                        .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
                        .body(axum::body::Body::from(
                            serde_json::to_vec(&json!({"config": {"writer": i}})).unwrap(),
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);

            let body = crate::helpers::body_json(response).await;
            body["version_number"].as_i64().unwrap()
        }));
    }

    let mut numbers = HashSet::new();
    for handle in handles {
        numbers.insert(handle.await.unwrap());
    }

    // Ten writers on top of v1: exactly 2..=11, no gaps, no duplicates.
    assert_eq!(numbers, (2..=11).collect::<HashSet<i64>>());
}

#[tokio::test]
async fn versions_are_full_snapshots() {
    let app = app();
    let created = app.create_agent("snap-bot").await;
    let agent_id = created["agent"]["id"].as_str().unwrap().to_string();
    let token = user_token(app.owner_id);

    app.post_json(
        &format!("/api/v1/agents/{agent_id}/versions"),
        &token,
        json!({"config": {"nodes": ["a"], "edges": []}}),
    )
    .await;

    // The first version still carries its own config, untouched.
    let v1_id = created["version"]["id"].as_str().unwrap();
    let v1 = body_json(
        app.get(
            &format!("/api/v1/agents/{agent_id}/versions/{v1_id}"),
            &token,
        )
        .await,
    )
    .await;
    assert_eq!(v1["config"], json!({"nodes": [], "edges": []}));
}

#[tokio::test]
async fn publish_stamps_published_at_exactly_once() {
    let app = app();
    let created = app.create_agent("pub-bot").await;
    let agent_id = created["agent"]["id"].as_str().unwrap().to_string();
    let version_id = created["version"]["id"].as_str().unwrap().to_string();
    let token = user_token(app.owner_id);

    let first = body_json(
        app.send(
            http::Request::put(format!(
                "/api/v1/agents/{agent_id}/versions/{version_id}/publish"
            ))
            .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
            .body(axum::body::Body::empty())
            .unwrap(),
        )
        .await,
    )
    .await;
    let stamp = first["published_at"].as_str().unwrap().to_string();

    let second = body_json(
        app.send(
            http::Request::put(format!(
                "/api/v1/agents/{agent_id}/versions/{version_id}/publish"
            ))
            .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
            .body(axum::body::Body::empty())
            .unwrap(),
        )
        .await,
    )
    .await;

    assert_eq!(second["published_at"].as_str().unwrap(), stamp);

    let agent = body_json(
        app.get(&format!("/api/v1/agents/{agent_id}"), &token).await,
    )
    .await;
    assert_eq!(agent["status"], "published");
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let app = app();

    let response = app
        .get(
            &format!("/api/v1/agents/{}", uuid::Uuid::new_v4()),
            &user_token(app.owner_id),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
