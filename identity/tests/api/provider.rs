use flowplane_identity::error::Error;
use flowplane_identity::provider::{HttpIdentityProvider, IdentityProvider};
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn signup_parses_the_assigned_user_id() {
    let server = MockServer::start().await;
    let user_id = Uuid::new_v4();

    Mock::given(method("POST"))
        .and(path("/auth/v1/signup"))
        .and(body_partial_json(json!({"email": "a@example.com"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": {"id": user_id, "email": "a@example.com"},
            "access_token": "jwt",
        })))
        .mount(&server)
        .await;

    let provider = HttpIdentityProvider::new(server.uri());
    let signup = provider.register("a@example.com", "Secret123!").await.unwrap();

    assert_eq!(signup.user_id, user_id);
    assert_eq!(signup.tokens["access_token"], "jwt");
}

#[tokio::test]
async fn signup_conflict_maps_to_email_taken() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/signup"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"detail": "already registered"})),
        )
        .mount(&server)
        .await;

    let provider = HttpIdentityProvider::new(server.uri());
    let error = provider
        .register("a@example.com", "Secret123!")
        .await
        .unwrap_err();

    assert!(matches!(error, Error::EmailTaken));
}

#[tokio::test]
async fn login_passes_the_token_payload_through() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/auth/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "jwt",
            "refresh_token": "refresh",
            "token_type": "bearer",
        })))
        .mount(&server)
        .await;

    let provider = HttpIdentityProvider::new(server.uri());
    let tokens = provider.login("a@example.com", "Secret123!").await.unwrap();

    assert_eq!(tokens["refresh_token"], "refresh");
}
