use flowplane_common::claims::{TokenFamily, TokenVerifier};
use flowplane_common::Secret;
use http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use crate::helpers::{app, body_json, M2M_AUDIENCE, M2M_ISSUER, M2M_SECRET, PROVIDER_SECRET};

async fn create_client(app: &crate::helpers::TestApp) -> (Uuid, String) {
    let response = app
        .post_json(
            "/api/v1/admin/clients",
            Some(&app.admin_token()),
            json!({"name": "conversation_service_client", "roles": ["conversation_client"]}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = body_json(response).await;
    (
        body["client_id"].as_str().unwrap().parse().unwrap(),
        body["client_secret"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn client_credentials_grant_mints_a_verifiable_token() {
    let app = app().await;
    let (client_id, client_secret) = create_client(&app).await;

    let response = app
        .post_json(
            "/api/v1/auth/token",
            None,
            json!({
                "grant_type": "client_credentials",
                "client_id": client_id,
                "client_secret": client_secret,
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], 900);

    let verifier = TokenVerifier::new(
        TokenFamily {
            secret: Secret::new(PROVIDER_SECRET.to_string()),
            issuer: None,
            audience: "authenticated".to_string(),
        },
        TokenFamily {
            secret: Secret::new(M2M_SECRET.to_string()),
            issuer: Some(M2M_ISSUER.to_string()),
            audience: M2M_AUDIENCE.to_string(),
        },
    );
    let verified = verifier.verify(body["access_token"].as_str().unwrap()).unwrap();
    let principal = verified.into_machine_principal().unwrap();

    assert_eq!(principal.id, client_id);
    assert!(principal.roles.contains("conversation_client"));
    assert!(principal.has_permission("identity:read"));
}

#[tokio::test]
async fn wrong_secret_is_unauthorized() {
    let app = app().await;
    let (client_id, _) = create_client(&app).await;

    let response = app
        .post_json(
            "/api/v1/auth/token",
            None,
            json!({
                "grant_type": "client_credentials",
                "client_id": client_id,
                "client_secret": "wrong",
            }),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn revoked_client_cannot_mint() {
    let app = app().await;
    let (client_id, client_secret) = create_client(&app).await;

    let revoke = app
        .send(
            http::Request::delete(format!("/api/v1/admin/clients/{client_id}"))
                .header(
                    http::header::AUTHORIZATION,
                    format!("Bearer {}", app.admin_token()),
                )
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(revoke.status(), StatusCode::NO_CONTENT);

    let response = app
        .post_json(
            "/api/v1/auth/token",
            None,
            json!({
                "grant_type": "client_credentials",
                "client_id": client_id,
                "client_secret": client_secret,
            }),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn only_client_credentials_is_supported() {
    let app = app().await;

    let response = app
        .post_json(
            "/api/v1/auth/token",
            None,
            json!({
                "grant_type": "password",
                "client_id": Uuid::new_v4(),
                "client_secret": "whatever",
            }),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn machine_token_reaches_the_grants_endpoint() {
    let app = app().await;
    let (client_id, client_secret) = create_client(&app).await;

    let token = body_json(
        app.post_json(
            "/api/v1/auth/token",
            None,
            json!({
                "grant_type": "client_credentials",
                "client_id": client_id,
                "client_secret": client_secret,
            }),
        )
        .await,
    )
    .await;

    let response = app
        .get(
            &format!("/api/v1/internal/grants/{}", app.member_id),
            Some(token["access_token"].as_str().unwrap()),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let grants = body_json(response).await;
    assert_eq!(grants["roles"], json!(["member"]));
}

#[tokio::test]
async fn member_token_cannot_read_grants() {
    let app = app().await;

    let response = app
        .get(
            &format!("/api/v1/internal/grants/{}", app.member_id),
            Some(&app.member_token()),
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
