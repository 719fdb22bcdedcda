use std::sync::Arc;

use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use crate::helpers::{
    app, app_with_validator, body_json, user_token, MissingVersionValidator,
};

fn create_body() -> serde_json::Value {
    json!({
        "agent_id": Uuid::new_v4(),
        "agent_version_id": Uuid::new_v4(),
    })
}

#[tokio::test]
async fn create_returns_a_pending_deployment_immediately() {
    let app = app();

    let response = app
        .post_json("/api/v1/deployments", &user_token(app.owner_id), create_body())
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["build_strategy"], "ci_driven");
    assert_eq!(body["deploy_strategy"], "serverless");
    assert_eq!(body["endpoint_url"], serde_json::Value::Null);
}

#[tokio::test]
async fn create_is_not_idempotent_at_the_api() {
    let app = app();
    let token = user_token(app.owner_id);
    let body = create_body();

    let first = body_json(app.post_json("/api/v1/deployments", &token, body.clone()).await).await;
    let second = body_json(app.post_json("/api/v1/deployments", &token, body).await).await;

    // Identical requests create distinct deployments.
    assert_ne!(first["id"], second["id"]);
}

#[tokio::test]
async fn unknown_version_is_rejected_synchronously() {
    let app = app_with_validator(Arc::new(MissingVersionValidator));

    let response = app
        .post_json("/api/v1/deployments", &user_token(app.owner_id), create_body())
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn owners_cannot_see_each_others_deployments() {
    let app = app();

    let created = body_json(
        app.post_json("/api/v1/deployments", &user_token(app.owner_id), create_body())
            .await,
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let response = app
        .get(&format!("/api/v1/deployments/{id}"), &user_token(Uuid::new_v4()))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn stopping_a_pending_deployment_needs_no_platform() {
    let app = app();
    let token = user_token(app.owner_id);

    let created = body_json(app.post_json("/api/v1/deployments", &token, create_body()).await).await;
    let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

    let response = app.delete(&format!("/api/v1/deployments/{id}"), &token).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "stopped");
    assert!(body["stopped_at"].is_string());

    // pending -> stopped directly, with no deploying in between.
    assert_eq!(
        app.dal
            .observed_statuses(id)
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        vec!["pending", "stopped"]
    );
}

#[tokio::test]
async fn stopping_twice_conflicts() {
    let app = app();
    let token = user_token(app.owner_id);

    let created = body_json(app.post_json("/api/v1/deployments", &token, create_body()).await).await;
    let id = created["id"].as_str().unwrap();

    app.delete(&format!("/api/v1/deployments/{id}"), &token).await;
    let second = app.delete(&format!("/api/v1/deployments/{id}"), &token).await;

    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn listing_filters_by_status() {
    let app = app();
    let token = user_token(app.owner_id);

    let created = body_json(app.post_json("/api/v1/deployments", &token, create_body()).await).await;
    app.post_json("/api/v1/deployments", &token, create_body()).await;
    let id = created["id"].as_str().unwrap();
    app.delete(&format!("/api/v1/deployments/{id}"), &token).await;

    let pending = body_json(
        app.get("/api/v1/deployments?status=pending", &token).await,
    )
    .await;
    assert_eq!(pending["total"], 1);

    let stopped = body_json(
        app.get("/api/v1/deployments?status=stopped", &token).await,
    )
    .await;
    assert_eq!(stopped["total"], 1);
}

#[tokio::test]
async fn transition_log_is_visible() {
    let app = app();
    let token = user_token(app.owner_id);

    let created = body_json(app.post_json("/api/v1/deployments", &token, create_body()).await).await;
    let id = created["id"].as_str().unwrap();
    app.delete(&format!("/api/v1/deployments/{id}"), &token).await;

    let transitions = body_json(
        app.get(&format!("/api/v1/deployments/{id}/transitions"), &token)
            .await,
    )
    .await;

    let to: Vec<&str> = transitions
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["to_status"].as_str().unwrap())
        .collect();
    assert_eq!(to, vec!["pending", "stopped"]);
}
