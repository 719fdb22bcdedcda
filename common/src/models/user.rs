use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Result of a successful registration: the stored profile plus the identity
/// provider's token payload, passed through unchanged.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegisterResponse {
    pub profile: ProfileResponse,
    pub tokens: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
}

/// Client-credentials grant request for `POST /auth/token`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: Uuid,
    pub client_secret: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateRoleRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoleResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreatePermissionRequest {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PermissionResponse {
    pub id: Uuid,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AttachPermissionRequest {
    pub permission_id: Uuid,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateClientRequest {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Returned exactly once, at client creation. The secret is never stored in
/// plaintext and cannot be recovered later.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientCreatedResponse {
    pub client_id: Uuid,
    pub client_secret: String,
    pub name: String,
    pub roles: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClientResponse {
    pub client_id: Uuid,
    pub name: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssignClientRolesRequest {
    pub roles: Vec<String>,
}

/// Grants of one user, served to other services by the identity store.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GrantsResponse {
    pub user_id: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}
