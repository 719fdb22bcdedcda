use std::sync::atomic::Ordering;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use flowplane_common::backends::auth::{effective_owner, ensure_owner, OnBehalfOf};
use flowplane_common::claims::Principal;
use flowplane_common::models::deployment::{
    CreateDeploymentRequest, DeploymentFilters, DeploymentResponse, DeploymentStatus,
    TransitionResponse,
};
use flowplane_common::models::error::{ApiError, Error, ErrorKind};
use flowplane_common::models::{Page, Paging};
use serde::Deserialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::dal::NewDeployment;

use super::RouterState;

const READ_ANY: &str = "deployment:read:any";
const WRITE_ANY: &str = "deployment:write:any";

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

#[instrument(skip(state, principal, request), fields(agent_id = %request.agent_id))]
pub(super) async fn create_deployment(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentResponse>), Error> {
    let owner_id = effective_owner(&principal, &on_behalf_of, WRITE_ANY)?;

    // Synchronous validation is the only part of the pipeline allowed to fail
    // the request; everything after lives on the deployment row.
    state
        .validator
        .validate(request.agent_id, request.agent_version_id, owner_id)
        .await?;

    let deployment = state
        .dal
        .insert(NewDeployment {
            owner_id,
            agent_id: request.agent_id,
            agent_version_id: request.agent_version_id,
            build_strategy: request
                .build_strategy
                .unwrap_or(state.default_build_strategy),
            deploy_strategy: request
                .deploy_strategy
                .unwrap_or(state.default_deploy_strategy),
            deployment_config: request.deployment_config.unwrap_or_default(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(deployment.into())))
}

#[instrument(skip(state, principal))]
pub(super) async fn get_deployment(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploymentResponse>, Error> {
    let deployment = state.dal.get(id).await?;
    ensure_access(&principal, &on_behalf_of, deployment.owner_id, READ_ANY)?;

    Ok(Json(deployment.into()))
}

// Flat on purpose: axum's query deserializer cannot see through `flatten`.
#[derive(Deserialize)]
pub(super) struct ListQuery {
    agent_id: Option<Uuid>,
    status: Option<DeploymentStatus>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[instrument(skip(state, principal, query))]
pub(super) async fn list_deployments(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Query(query): Query<ListQuery>,
) -> Result<Json<Page<DeploymentResponse>>, Error> {
    let effective = effective_owner(&principal, &on_behalf_of, READ_ANY)?;
    let owner_scope = if on_behalf_of.0.is_none() && principal.has_permission(READ_ANY) {
        None
    } else {
        Some(effective)
    };

    let page = state
        .dal
        .list(
            owner_scope,
            &DeploymentFilters {
                agent_id: query.agent_id,
                status: query.status,
            },
            &Paging {
                page: query.page,
                page_size: query.page_size,
            },
        )
        .await?;

    Ok(Json(Page {
        items: page.items.into_iter().map(Into::into).collect(),
        page: page.page,
        page_size: page.page_size,
        total: page.total,
    }))
}

/// Stop is valid in any non-terminal state, plus `running`.
///
/// A still-pending deployment is flipped to `stopped` directly, with no
/// platform call. Anything a worker may be touching is flagged instead; the
/// worker observes the flag between stages and runs the teardown.
#[instrument(skip(state, principal))]
pub(super) async fn stop_deployment(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DeploymentResponse>), Error> {
    let deployment = state.dal.get(id).await?;
    ensure_access(&principal, &on_behalf_of, deployment.owner_id, WRITE_ANY)?;

    match deployment.status {
        DeploymentStatus::Stopped | DeploymentStatus::Failed => {
            return Err(Error::custom(
                ErrorKind::Conflict,
                format!("deployment is already {}", deployment.status),
            ));
        }
        DeploymentStatus::Pending => {
            match state
                .dal
                .transition(
                    id,
                    DeploymentStatus::Stopped,
                    Some("stopped before pickup".to_string()),
                    None,
                    None,
                )
                .await
            {
                Ok(stopped) => return Ok((StatusCode::OK, Json(stopped.into()))),
                // A worker picked it up in the meantime; fall through to the
                // cancellation flag.
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    debug!("deployment left pending while stopping, flagging instead");
                }
                Err(err) => return Err(err),
            }
        }
        DeploymentStatus::Deploying | DeploymentStatus::Running => {}
    }

    let flagged = state.dal.request_stop(id).await?;

    Ok((StatusCode::ACCEPTED, Json(flagged.into())))
}

#[instrument(skip(state, principal))]
pub(super) async fn list_transitions(
    State(state): State<RouterState>,
    principal: Principal,
    on_behalf_of: OnBehalfOf,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<TransitionResponse>>, Error> {
    let deployment = state.dal.get(id).await?;
    ensure_access(&principal, &on_behalf_of, deployment.owner_id, READ_ANY)?;

    let transitions = state
        .dal
        .transitions(id)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(transitions))
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
