use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::models::agent::{AgentResponse, AgentVersionResponse};
use crate::models::deployment::{DeploymentFilters, DeploymentResponse, DeploymentStatus};
use crate::models::error::ApiError;
use crate::models::user::{GrantsResponse, TokenRequest, TokenResponse};
use crate::models::Page;

use super::headers::X_ON_BEHALF_OF;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to reach service: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request did not return correctly, got status code: {status}: {detail}")]
    RequestError { status: StatusCode, detail: String },
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Http(err) => err.status(),
            ClientError::RequestError { status, .. } => Some(*status),
        }
    }

    /// Whether retrying the call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(err) => err.is_timeout() || err.is_connect(),
            ClientError::RequestError { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// `reqwest` wrapper to make requests to RESTful control plane and platform
/// services easy.
#[derive(Clone)]
pub struct ServicesApiClient {
    client: reqwest::Client,
    base: String,
}

impl ServicesApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_timeout(base, Duration::from_secs(30))
    }

    pub fn with_timeout(base: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("to build a reqwest client");

        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        bearer: Option<&str>,
    ) -> Result<T, ClientError> {
        self.request_with_headers(method, path, body, bearer, HeaderMap::new())
            .await
    }

    pub async fn request_with_headers<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        bearer: Option<&str>,
        headers: HeaderMap,
    ) -> Result<T, ClientError> {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        trace!(url, "calling service");

        let mut request = self.client.request(method, &url).headers(headers);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let detail = response
                .json::<ApiError>()
                .await
                .map(|err| err.detail)
                .unwrap_or_else(|_| status.to_string());

            return Err(ClientError::RequestError { status, detail });
        }

        Ok(response.json().await?)
    }
}

/// Client for the identity store, authenticating with the service's own
/// machine credentials.
#[derive(Clone)]
pub struct IdentityApiClient {
    api: ServicesApiClient,
    tokens: Arc<MachineTokenSource>,
}

impl IdentityApiClient {
    pub fn new(api: ServicesApiClient, tokens: Arc<MachineTokenSource>) -> Self {
        Self { api, tokens }
    }

    /// Roles and permissions of one user, for principal construction.
    pub async fn grants_for(&self, user_id: Uuid) -> Result<GrantsResponse, ClientError> {
        let token = self.tokens.token().await?;

        self.api
            .request::<(), _>(
                Method::GET,
                &format!("api/v1/internal/grants/{user_id}"),
                None,
                Some(&token),
            )
            .await
    }
}

/// Client for the agent catalog.
#[derive(Clone)]
pub struct CatalogApiClient {
    api: ServicesApiClient,
    tokens: Arc<MachineTokenSource>,
}

impl CatalogApiClient {
    pub fn new(api: ServicesApiClient, tokens: Arc<MachineTokenSource>) -> Self {
        Self { api, tokens }
    }

    fn on_behalf_headers(owner_id: Option<Uuid>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(owner_id) = owner_id {
            if let Ok(value) = owner_id.to_string().parse() {
                headers.insert(X_ON_BEHALF_OF.clone(), value);
            }
        }
        headers
    }

    pub async fn get_agent(
        &self,
        agent_id: Uuid,
        on_behalf_of: Option<Uuid>,
    ) -> Result<AgentResponse, ClientError> {
        let token = self.tokens.token().await?;

        self.api
            .request_with_headers::<(), _>(
                Method::GET,
                &format!("api/v1/agents/{agent_id}"),
                None,
                Some(&token),
                Self::on_behalf_headers(on_behalf_of),
            )
            .await
    }

    pub async fn get_version(
        &self,
        agent_id: Uuid,
        version_id: Uuid,
        on_behalf_of: Option<Uuid>,
    ) -> Result<AgentVersionResponse, ClientError> {
        let token = self.tokens.token().await?;

        self.api
            .request_with_headers::<(), _>(
                Method::GET,
                &format!("api/v1/agents/{agent_id}/versions/{version_id}"),
                None,
                Some(&token),
                Self::on_behalf_headers(on_behalf_of),
            )
            .await
    }

    pub async fn get_latest_version(
        &self,
        agent_id: Uuid,
        on_behalf_of: Option<Uuid>,
    ) -> Result<AgentVersionResponse, ClientError> {
        let token = self.tokens.token().await?;

        self.api
            .request_with_headers::<(), _>(
                Method::GET,
                &format!("api/v1/agents/{agent_id}/versions/latest"),
                None,
                Some(&token),
                Self::on_behalf_headers(on_behalf_of),
            )
            .await
    }
}

/// Client for the deployment engine.
#[derive(Clone)]
pub struct DeployerApiClient {
    api: ServicesApiClient,
    tokens: Arc<MachineTokenSource>,
}

impl DeployerApiClient {
    pub fn new(api: ServicesApiClient, tokens: Arc<MachineTokenSource>) -> Self {
        Self { api, tokens }
    }

    pub async fn get_deployment(&self, id: Uuid) -> Result<DeploymentResponse, ClientError> {
        let token = self.tokens.token().await?;

        self.api
            .request::<(), _>(
                Method::GET,
                &format!("api/v1/deployments/{id}"),
                None,
                Some(&token),
            )
            .await
    }

    pub async fn list_deployments(
        &self,
        filters: &DeploymentFilters,
    ) -> Result<Page<DeploymentResponse>, ClientError> {
        let token = self.tokens.token().await?;

        let mut query = Vec::new();
        if let Some(agent_id) = filters.agent_id {
            query.push(format!("agent_id={agent_id}"));
        }
        if let Some(status) = filters.status {
            query.push(format!("status={status}"));
        }
        let suffix = if query.is_empty() {
            String::new()
        } else {
            format!("?{}", query.join("&"))
        };

        self.api
            .request::<(), _>(
                Method::GET,
                &format!("api/v1/deployments{suffix}"),
                None,
                Some(&token),
            )
            .await
    }

    /// The endpoint of the newest running deployment for an agent, if any.
    pub async fn running_endpoint(&self, agent_id: Uuid) -> Result<Option<String>, ClientError> {
        let page = self
            .list_deployments(&DeploymentFilters {
                agent_id: Some(agent_id),
                status: Some(DeploymentStatus::Running),
            })
            .await?;

        Ok(page.items.into_iter().find_map(|d| d.endpoint_url))
    }
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Mints machine tokens with the service's bootstrap credentials and caches
/// them until one minute before expiry.
pub struct MachineTokenSource {
    api: ServicesApiClient,
    client_id: Uuid,
    client_secret: crate::Secret,
    cached: tokio::sync::RwLock<Option<CachedToken>>,
}

impl MachineTokenSource {
    pub fn new(
        identity: ServicesApiClient,
        client_id: Uuid,
        client_secret: crate::Secret,
    ) -> Self {
        Self {
            api: identity,
            client_id,
            client_secret,
            cached: tokio::sync::RwLock::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, ClientError> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.expires_at - chrono::Duration::seconds(60) > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at - chrono::Duration::seconds(60) > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let response: TokenResponse = self
            .api
            .request(
                Method::POST,
                "api/v1/auth/token",
                Some(&TokenRequest {
                    grant_type: "client_credentials".to_string(),
                    client_id: self.client_id,
                    client_secret: self.client_secret.expose().to_string(),
                }),
                None,
            )
            .await?;

        let token = response.access_token.clone();
        *guard = Some(CachedToken {
            token: response.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in as i64),
        });

        Ok(token)
    }
}
