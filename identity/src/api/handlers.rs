use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use flowplane_common::claims::{Principal, PrincipalKind};
use flowplane_common::models::error::ApiError;
use flowplane_common::models::user::{
    AssignClientRolesRequest, AttachPermissionRequest, ClientCreatedResponse, ClientResponse,
    CreateClientRequest, CreatePermissionRequest, CreateRoleRequest, GrantsResponse, LoginRequest,
    PermissionResponse, ProfileResponse, RegisterRequest, RegisterResponse, RoleResponse,
    TokenRequest, TokenResponse, UpdateProfileRequest,
};
use serde_json::Value;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::error::Error;

use super::RouterState;

const ADMIN_PERMISSION: &str = "admin:manage";
const GRANTS_PERMISSION: &str = "identity:read";

#[instrument(skip(state, request), fields(email = %request.email))]
pub(super) async fn register(
    State(state): State<RouterState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), Error> {
    let signup = state
        .provider
        .register(&request.email, &request.password)
        .await?;

    // The profile insert and the default role assignment share a transaction;
    // any failure reports the registration as failed.
    let profile = state
        .profiles
        .create_profile(
            signup.user_id,
            &request.email,
            request.display_name.as_deref(),
        )
        .await
        .map_err(|err| match err {
            Error::EmailTaken => Error::EmailTaken,
            other => {
                error!(
                    error = &other as &dyn std::error::Error,
                    "profile insert failed after provider signup"
                );
                Error::Registration("failed to store the user profile".to_string())
            }
        })?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            profile: profile.into(),
            tokens: signup.tokens,
        }),
    ))
}

#[instrument(skip(state, request), fields(email = %request.email))]
pub(super) async fn login(
    State(state): State<RouterState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, Error> {
    // Tokens are returned to the caller unchanged.
    let tokens = state.provider.login(&request.email, &request.password).await?;

    Ok(Json(tokens))
}

#[instrument(skip(state, principal))]
pub(super) async fn get_me(
    State(state): State<RouterState>,
    principal: Principal,
) -> Result<Json<ProfileResponse>, Error> {
    let profile = state.profiles.get_profile(principal.id).await?;

    Ok(Json(profile.into()))
}

#[instrument(skip(state, principal, request))]
pub(super) async fn update_me(
    State(state): State<RouterState>,
    principal: Principal,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileResponse>, Error> {
    let profile = state
        .profiles
        .update_profile(principal.id, request.display_name)
        .await?;

    Ok(Json(profile.into()))
}

#[instrument(skip(state, request))]
pub(super) async fn token(
    State(state): State<RouterState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, Error> {
    if request.grant_type != "client_credentials" {
        return Err(Error::UnsupportedGrantType);
    }

    let client = state
        .clients
        .verify_credentials(request.client_id, &request.client_secret)
        .await?;

    // The roles embedded in the token are verified against the store here, at
    // issuance time; the verifier trusts them afterwards.
    let permissions = state.rbac.permissions_for_roles(&client.roles).await?;
    let response = state.minter.mint(client.client_id, client.roles, permissions)?;

    Ok(Json(response))
}

#[instrument(skip(state, principal, request))]
pub(super) async fn create_role(
    State(state): State<RouterState>,
    principal: Principal,
    Json(request): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<RoleResponse>), Error> {
    principal.require(ADMIN_PERMISSION)?;

    let role = state
        .rbac
        .create_role(&request.name, request.description.as_deref())
        .await?;

    Ok((StatusCode::CREATED, Json(role.into())))
}

#[instrument(skip(state, principal))]
pub(super) async fn list_roles(
    State(state): State<RouterState>,
    principal: Principal,
) -> Result<Json<Vec<RoleResponse>>, Error> {
    principal.require(ADMIN_PERMISSION)?;

    let roles = state.rbac.list_roles().await?;

    Ok(Json(roles.into_iter().map(Into::into).collect()))
}

#[instrument(skip(state, principal))]
pub(super) async fn delete_role(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    principal.require(ADMIN_PERMISSION)?;

    state.rbac.delete_role(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, principal, request))]
pub(super) async fn attach_permission(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(request): Json<AttachPermissionRequest>,
) -> Result<StatusCode, Error> {
    principal.require(ADMIN_PERMISSION)?;

    state.rbac.attach_permission(id, request.permission_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, principal, request))]
pub(super) async fn create_permission(
    State(state): State<RouterState>,
    principal: Principal,
    Json(request): Json<CreatePermissionRequest>,
) -> Result<(StatusCode, Json<PermissionResponse>), Error> {
    principal.require(ADMIN_PERMISSION)?;

    let permission = state.rbac.create_permission(&request.name).await?;

    Ok((StatusCode::CREATED, Json(permission.into())))
}

#[instrument(skip(state, principal))]
pub(super) async fn list_permissions(
    State(state): State<RouterState>,
    principal: Principal,
) -> Result<Json<Vec<PermissionResponse>>, Error> {
    principal.require(ADMIN_PERMISSION)?;

    let permissions = state.rbac.list_permissions().await?;

    Ok(Json(permissions.into_iter().map(Into::into).collect()))
}

#[instrument(skip(state, principal))]
pub(super) async fn delete_permission(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    principal.require(ADMIN_PERMISSION)?;

    state.rbac.delete_permission(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, principal, request), fields(client_name = %request.name))]
pub(super) async fn create_client(
    State(state): State<RouterState>,
    principal: Principal,
    Json(request): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<ClientCreatedResponse>), Error> {
    principal.require(ADMIN_PERMISSION)?;

    let (client, secret) = state
        .clients
        .create_client(&request.name, &request.roles)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ClientCreatedResponse {
            client_id: client.client_id,
            client_secret: secret,
            name: client.name,
            roles: client.roles,
        }),
    ))
}

#[instrument(skip(state, principal))]
pub(super) async fn list_clients(
    State(state): State<RouterState>,
    principal: Principal,
) -> Result<Json<Vec<ClientResponse>>, Error> {
    principal.require(ADMIN_PERMISSION)?;

    let clients = state.clients.list_clients().await?;

    Ok(Json(clients.into_iter().map(Into::into).collect()))
}

#[instrument(skip(state, principal, request))]
pub(super) async fn assign_client_roles(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    Json(request): Json<AssignClientRolesRequest>,
) -> Result<Json<ClientResponse>, Error> {
    principal.require(ADMIN_PERMISSION)?;

    let client = state.clients.assign_roles(id, &request.roles).await?;

    Ok(Json(client.into()))
}

#[instrument(skip(state, principal))]
pub(super) async fn revoke_client(
    State(state): State<RouterState>,
    principal: Principal,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    principal.require(ADMIN_PERMISSION)?;

    state.clients.revoke(id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, principal))]
pub(super) async fn get_grants(
    State(state): State<RouterState>,
    principal: Principal,
    Path(user_id): Path<Uuid>,
) -> Result<Json<GrantsResponse>, Error> {
    // Machine-only internal surface backing the token verifier's user lookups.
    if principal.kind != PrincipalKind::Machine && !principal.is_admin() {
        return Err(Error::Forbidden(GRANTS_PERMISSION.to_string()));
    }
    principal.require(GRANTS_PERMISSION)?;

    let (roles, permissions) = state.rbac.grants_for_user(user_id).await?;

    Ok(Json(GrantsResponse {
        user_id,
        roles,
        permissions,
    }))
}

pub(super) async fn liveness() -> Json<Value> {
    Json(serde_json::json!({"status": "alive"}))
}

#[instrument(skip(state))]
pub(super) async fn readiness(State(state): State<RouterState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) && state.profiles.healthy().await {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response()
    } else {
        ApiError::new("not ready", StatusCode::SERVICE_UNAVAILABLE).into_response()
    }
}
