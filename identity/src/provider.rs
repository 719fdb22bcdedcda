use async_trait::async_trait;
use flowplane_common::backends::client::{ClientError, ServicesApiClient};
use http::{Method, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Error;

/// Outcome of a signup against the identity provider: the user id it assigned
/// plus the raw token payload, which is passed through to the caller unchanged.
#[derive(Clone, Debug)]
pub struct ProviderSignup {
    pub user_id: Uuid,
    pub tokens: Value,
}

/// The external identity provider that issues user tokens.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn register(&self, email: &str, password: &str) -> Result<ProviderSignup, Error>;

    /// Password login. The provider's token response is returned verbatim.
    async fn login(&self, email: &str, password: &str) -> Result<Value, Error>;
}

pub struct HttpIdentityProvider {
    api: ServicesApiClient,
}

impl HttpIdentityProvider {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            api: ServicesApiClient::new(base_uri),
        }
    }

    fn map_error(error: ClientError, login: bool) -> Error {
        match &error {
            ClientError::RequestError { status, detail } => match *status {
                StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Error::EmailTaken,
                StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST if login => {
                    Error::Provider("invalid credentials".to_string())
                }
                _ => Error::Provider(detail.clone()),
            },
            ClientError::Http(_) => Error::ProviderUnavailable,
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn register(&self, email: &str, password: &str) -> Result<ProviderSignup, Error> {
        let response: Value = self
            .api
            .request(
                Method::POST,
                "auth/v1/signup",
                Some(&json!({"email": email, "password": password})),
                None,
            )
            .await
            .map_err(|err| Self::map_error(err, false))?;

        // Providers either nest the user object or return it at the top level.
        let id = response["user"]["id"]
            .as_str()
            .or_else(|| response["id"].as_str())
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| {
                Error::Provider("signup response is missing the user id".to_string())
            })?;

        Ok(ProviderSignup {
            user_id: id,
            tokens: response,
        })
    }

    async fn login(&self, email: &str, password: &str) -> Result<Value, Error> {
        self.api
            .request(
                Method::POST,
                "auth/v1/token?grant_type=password",
                Some(&json!({"email": email, "password": password})),
                None,
            )
            .await
            .map_err(|err| Self::map_error(err, true))
    }
}
