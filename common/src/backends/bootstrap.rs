use std::path::PathBuf;
use std::sync::Arc;

use http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::user::{ClientCreatedResponse, ClientResponse, LoginRequest};
use crate::Secret;

use super::client::{ClientError, MachineTokenSource, ServicesApiClient};

/// Everything a service needs to acquire its machine identity at cold start.
pub struct BootstrapSettings {
    /// Base URI of the identity store.
    pub identity_uri: String,
    pub admin_email: String,
    pub admin_password: Secret,
    /// Well-known machine client name of this service, e.g.
    /// `conversation_service_client`.
    pub client_name: String,
    /// Roles requested when the client is first created.
    pub client_roles: Vec<String>,
    /// Where the discovered client id/secret are persisted between cold starts.
    pub credentials_path: PathBuf,
}

/// The credentials file written at first bootstrap and read ever after.
#[derive(Deserialize, Serialize)]
pub struct ServiceCredentials {
    pub client_id: Uuid,
    pub client_secret: String,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("admin login against the identity store failed: {0}")]
    AdminLogin(ClientError),
    #[error("identity store request failed: {0}")]
    Client(#[from] ClientError),
    #[error(
        "machine client '{0}' already exists but no local credentials were found; \
         restore the credentials file or revoke the client"
    )]
    CredentialsMissing(String),
    #[error("failed to read or write the credentials file: {0}")]
    Io(#[from] std::io::Error),
    #[error("credentials file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Run the cold start bootstrap protocol against the identity store.
///
/// Idempotent and at-most-once observable: an existing client is reused via
/// the stored credentials file; an existing client without stored credentials
/// is a startup error, never a silently created duplicate. The startup path
/// treats any error here as fatal.
pub async fn bootstrap(settings: BootstrapSettings) -> Result<Arc<MachineTokenSource>, BootstrapError> {
    let identity = ServicesApiClient::new(&settings.identity_uri);

    let admin_token = admin_login(&identity, &settings).await?;

    let existing: Vec<ClientResponse> = identity
        .request::<(), _>(
            Method::GET,
            "api/v1/admin/clients",
            None,
            Some(&admin_token),
        )
        .await?;
    let registered = existing
        .iter()
        .find(|client| client.name == settings.client_name && client.revoked_at.is_none());

    let stored = read_credentials(&settings.credentials_path).await?;

    let credentials = match (registered, stored) {
        (Some(_), Some(credentials)) => {
            info!(client = %settings.client_name, "reusing stored machine credentials");
            credentials
        }
        (Some(_), None) => {
            return Err(BootstrapError::CredentialsMissing(settings.client_name));
        }
        (None, _) => {
            info!(client = %settings.client_name, "registering machine client");
            let created: ClientCreatedResponse = identity
                .request(
                    Method::POST,
                    "api/v1/admin/clients",
                    Some(&serde_json::json!({
                        "name": settings.client_name,
                        "roles": settings.client_roles,
                    })),
                    Some(&admin_token),
                )
                .await?;

            let credentials = ServiceCredentials {
                client_id: created.client_id,
                client_secret: created.client_secret,
            };
            write_credentials(&settings.credentials_path, &credentials).await?;
            credentials
        }
    };

    Ok(Arc::new(MachineTokenSource::new(
        identity,
        credentials.client_id,
        Secret::new(credentials.client_secret),
    )))
}

async fn admin_login(
    identity: &ServicesApiClient,
    settings: &BootstrapSettings,
) -> Result<String, BootstrapError> {
    let tokens: serde_json::Value = identity
        .request(
            Method::POST,
            "api/v1/auth/users/login",
            Some(&LoginRequest {
                email: settings.admin_email.clone(),
                password: settings.admin_password.expose().to_string(),
            }),
            None,
        )
        .await
        .map_err(BootstrapError::AdminLogin)?;

    tokens["access_token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            BootstrapError::AdminLogin(ClientError::RequestError {
                status: http::StatusCode::BAD_GATEWAY,
                detail: "login response is missing 'access_token'".to_string(),
            })
        })
}

async fn read_credentials(path: &PathBuf) -> Result<Option<ServiceCredentials>, BootstrapError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_credentials(
    path: &PathBuf,
    credentials: &ServiceCredentials,
) -> Result<(), BootstrapError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_vec_pretty(credentials)?).await?;

    Ok(())
}
