use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::{Router, Server};
use flowplane_common::backends::auth::{AuthLayer, GrantsSource};
use flowplane_common::backends::client::CatalogApiClient;
use flowplane_common::backends::trace::RequestIdLayer;
use flowplane_common::claims::TokenVerifier;
use flowplane_common::models::deployment::{BuildStrategyKind, DeployStrategyKind};
use flowplane_common::models::error::{Error, ErrorKind};
use http::StatusCode;
use uuid::Uuid;

use crate::dal::Dal;

mod handlers;

use handlers::*;

/// Pre-insert validation of the requested agent version, answered by the
/// catalog.
#[async_trait]
pub trait VersionValidator: Send + Sync {
    /// Confirm the version exists, belongs to the agent, and is visible to
    /// the owner the request acts as.
    async fn validate(&self, agent_id: Uuid, version_id: Uuid, owner_id: Uuid)
        -> Result<(), Error>;
}

#[async_trait]
impl VersionValidator for CatalogApiClient {
    async fn validate(
        &self,
        agent_id: Uuid,
        version_id: Uuid,
        owner_id: Uuid,
    ) -> Result<(), Error> {
        match self.get_version(agent_id, version_id, Some(owner_id)).await {
            Ok(_) => Ok(()),
            Err(err) => match err.status() {
                Some(StatusCode::NOT_FOUND) => Err(Error::custom(
                    ErrorKind::NotFound,
                    "agent version not found for that agent",
                )),
                Some(StatusCode::FORBIDDEN) => Err(Error::from_kind(ErrorKind::Forbidden)),
                _ => Err(Error::source(ErrorKind::TransientUnavailable, err)),
            },
        }
    }
}

#[derive(Clone)]
pub struct RouterState {
    pub dal: Arc<dyn Dal>,
    pub validator: Arc<dyn VersionValidator>,
    pub default_build_strategy: BuildStrategyKind,
    pub default_deploy_strategy: DeployStrategyKind,
    pub ready: Arc<AtomicBool>,
}

pub struct ApiBuilder {
    state: Option<RouterState>,
    verifier: Option<TokenVerifier>,
    grants: Option<Arc<dyn GrantsSource>>,
}

impl Default for ApiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiBuilder {
    pub fn new() -> Self {
        Self {
            state: None,
            verifier: None,
            grants: None,
        }
    }

    pub fn with_state(mut self, state: RouterState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_grants(mut self, grants: Arc<dyn GrantsSource>) -> Self {
        self.grants = Some(grants);
        self
    }

    pub fn into_router(self) -> Router {
        let state = self.state.expect("a router state is required");
        let verifier = self.verifier.expect("a token verifier is required");
        let grants = self.grants.expect("a grants source is required");

        let public = Router::new()
            .route("/health/liveness", get(liveness))
            .route("/health/readiness", get(readiness));

        let protected = Router::new()
            .route(
                "/api/v1/deployments",
                axum::routing::post(create_deployment).get(list_deployments),
            )
            .route(
                "/api/v1/deployments/:id",
                get(get_deployment).delete(stop_deployment),
            )
            .route("/api/v1/deployments/:id/transitions", get(list_transitions))
            .layer(AuthLayer::new(verifier, grants));

        public
            .merge(protected)
            .layer(RequestIdLayer)
            .with_state(state)
    }
}

pub async fn serve(router: Router, address: SocketAddr) {
    Server::bind(&address)
        .serve(router.into_make_service())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to address: {}", address));
}
