use std::sync::atomic::Ordering;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use flowplane_common::backends::auth::{effective_owner, ensure_owner, OnBehalfOf};
use flowplane_common::claims::Principal;
use flowplane_common::models::agent::{
    AgentFilters, AgentResponse, AgentVersionResponse, CreateAgentRequest,
    UpdateAgentConfigRequest, UpdateAgentRequest,
};
use flowplane_common::models::error::{ApiError, Error, ErrorKind};
use flowplane_common::models::{Page, Paging};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use super::RouterState;

const READ_ANY: &str = "agent:read:any";
const WRITE_ANY: &str = "agent:write:any";

// Flat on purpose: axum's query deserializer cannot see through `flatten`.
#[derive(Deserialize)]
pub(super) struct ListQuery {
    status: Option<flowplane_common::models::agent::AgentStatus>,
    tag: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

impl ListQuery {
    fn filters(&self) -> AgentFilters {
        AgentFilters {
            status: self.status,
            tag: self.tag.clone(),
        }
    }

    fn paging(&self) -> Paging {
        Paging {
            page: self.page,
            page_size: self.page_size,
        }
    }
}

/// The ownership rule with the on-behalf-of pivot applied: a pivoted machine
/// acts exactly as the named user, everyone else is the owner or holds the
/// `*:any` permission.
fn ensure_access(
    principal: &Principal,
    on_behalf_of: &OnBehalfOf,
    owner_id: Uuid,
    any_permission: &str,
) -> Result<(), Error> {
    let effective = effective_owner(principal, on_behalf_of, any_permission)?;
    if effective == owner_id {
        return Ok(());
    }
    if on_behalf_of.0.is_some() {
        return Err(Error::from_kind(ErrorKind::Forbidden));
    }

    ensure_owner(principal, owner_id, any_permission)
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::custom(ErrorKind::InvalidInput, "agent name must not be empty"));
    }

    Ok(())
}

fn validate_config(config: &serde_json::Value, max_bytes: usize) -> Result<(), Error> {
    let size = serde_json::to_vec(config).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > max_bytes {
        return Err(Error::custom(
            ErrorKind::PayloadTooLarge,
            format!("config document exceeds the {max_bytes} byte limit"),
        ));
    }

    Ok(())
}

#[instrument(skip(state, principal, request), fields(agent_name = %request.name))]
pub(super) async fn create_agent(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Json(request): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), Error> {
    validate_name(&request.name)?;
    validate_config(&request.config, state.config_max_bytes)?;

    let owner_id = effective_owner(&principal, &on_behalf_of, WRITE_ANY)?;

    let (agent, version) = state
        .dal
        .create_agent(
            owner_id,
            request.name.trim(),
            request.description.as_deref(),
            &request.tags,
            request.config,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "agent": AgentResponse::from(agent),
            "version": AgentVersionResponse::from(version),
        })),
    ))
}

#[instrument(skip(state, principal))]
pub(super) async fn get_agent(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<AgentResponse>, Error> {
    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, READ_ANY)?;

    Ok(Json(agent.into()))
}

#[instrument(skip(state, principal, request))]
pub(super) async fn update_agent(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(agent_id): Path<Uuid>,
    Json(request): Json<UpdateAgentRequest>,
) -> Result<Json<AgentResponse>, Error> {
    if let Some(name) = &request.name {
        validate_name(name)?;
    }

    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, WRITE_ANY)?;

    let agent = state
        .dal
        .update_agent(
            agent_id,
            request.name.map(|name| name.trim().to_string()),
            request.description,
            request.tags,
        )
        .await?;

    Ok(Json(agent.into()))
}

#[instrument(skip(state, principal))]
pub(super) async fn archive_agent(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<AgentResponse>, Error> {
    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, WRITE_ANY)?;

    let agent = state.dal.archive_agent(agent_id).await?;

    Ok(Json(agent.into()))
}

#[instrument(skip(state, principal, query))]
pub(super) async fn list_agents(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<AgentResponse>>, Error> {
    let effective = effective_owner(&principal, &on_behalf_of, READ_ANY)?;

    // Cross-owner listing needs the read-any grant; everyone else sees their
    // own agents.
    let owner_scope = if on_behalf_of.0.is_none() && principal.has_permission(READ_ANY) {
        None
    } else {
        Some(effective)
    };

    let page = state
        .dal
        .list_agents(owner_scope, &query.filters(), &query.paging())
        .await?;

    Ok(Json(Page {
        items: page.items.into_iter().map(Into::into).collect(),
        page: page.page,
        page_size: page.page_size,
        total: page.total,
    }))
}

#[instrument(skip(state, principal, request))]
pub(super) async fn update_agent_config(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(agent_id): Path<Uuid>,
    Json(request): Json<UpdateAgentConfigRequest>,
) -> Result<(StatusCode, Json<AgentVersionResponse>), Error> {
    validate_config(&request.config, state.config_max_bytes)?;

    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, WRITE_ANY)?;

    let version = state
        .dal
        .insert_version(agent_id, request.config, request.changelog)
        .await?;

    Ok((StatusCode::CREATED, Json(version.into())))
}

#[instrument(skip(state, principal))]
pub(super) async fn get_version(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path((agent_id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AgentVersionResponse>, Error> {
    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, READ_ANY)?;

    let version = state.dal.get_version(agent_id, version_id).await?;

    Ok(Json(version.into()))
}

#[instrument(skip(state, principal))]
pub(super) async fn latest_version(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<AgentVersionResponse>, Error> {
    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, READ_ANY)?;

    let version = state.dal.latest_version(agent_id).await?;

    Ok(Json(version.into()))
}

#[instrument(skip(state, principal, paging))]
pub(super) async fn list_versions(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(agent_id): Path<Uuid>,
    Query(paging): Query<Paging>,
) -> Result<Json<Page<AgentVersionResponse>>, Error> {
    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, READ_ANY)?;

    let page = state.dal.list_versions(agent_id, &paging).await?;

    Ok(Json(Page {
        items: page.items.into_iter().map(Into::into).collect(),
        page: page.page,
        page_size: page.page_size,
        total: page.total,
    }))
}

#[instrument(skip(state, principal))]
pub(super) async fn publish_version(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path((agent_id, version_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<AgentVersionResponse>, Error> {
    let agent = state.dal.get_agent(agent_id).await?;
    ensure_access(&principal, &on_behalf_of, agent.owner_id, WRITE_ANY)?;

    let version = state.dal.publish_version(agent_id, version_id).await?;

    Ok(Json(version.into()))
}

pub(super) async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "alive"}))
}

#[instrument(skip(state))]
pub(super) async fn readiness(State(state): State<RouterState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) && state.dal.healthy().await {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"}))).into_response()
    } else {
        ApiError::new("not ready", StatusCode::SERVICE_UNAVAILABLE).into_response()
    }
}
