use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::{get, post, put};
use axum::{Router, Server};
use flowplane_common::backends::auth::{AuthLayer, GrantsSource};
use flowplane_common::backends::client::ClientError;
use flowplane_common::backends::trace::RequestIdLayer;
use flowplane_common::claims::TokenVerifier;
use flowplane_common::models::user::GrantsResponse;
use uuid::Uuid;

use crate::client::{ClientManagement, TokenMinter};
use crate::provider::IdentityProvider;
use crate::rbac::RbacManagement;
use crate::user::ProfileManagement;

mod handlers;

use handlers::*;

#[derive(Clone)]
pub struct RouterState {
    pub profiles: Arc<dyn ProfileManagement>,
    pub rbac: Arc<dyn RbacManagement>,
    pub clients: Arc<dyn ClientManagement>,
    pub provider: Arc<dyn IdentityProvider>,
    pub minter: Arc<TokenMinter>,
    pub ready: Arc<AtomicBool>,
}

/// The identity store resolves user grants out of its own tables instead of
/// calling itself over HTTP.
struct LocalGrants {
    rbac: Arc<dyn RbacManagement>,
}

#[async_trait]
impl GrantsSource for LocalGrants {
    async fn grants_for(&self, user_id: Uuid) -> Result<GrantsResponse, ClientError> {
        let (roles, permissions) =
            self.rbac
                .grants_for_user(user_id)
                .await
                .map_err(|err| ClientError::RequestError {
                    status: http::StatusCode::INTERNAL_SERVER_ERROR,
                    detail: err.to_string(),
                })?;

        Ok(GrantsResponse {
            user_id,
            roles,
            permissions,
        })
    }
}

pub struct ApiBuilder {
    state: Option<RouterState>,
    verifier: Option<TokenVerifier>,
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

    pub fn into_router(self) -> Router {
        let state = self.state.expect("a router state is required");
        let verifier = self.verifier.expect("a token verifier is required");

        let auth_layer = AuthLayer::new(
            verifier,
            Arc::new(LocalGrants {
                rbac: state.rbac.clone(),
            }),
        );

        let public = Router::new()
            .route("/api/v1/auth/users/register", post(register))
            .route("/api/v1/auth/users/login", post(login))
            .route("/api/v1/auth/token", post(token))
            .route("/health/liveness", get(liveness))
            .route("/health/readiness", get(readiness));

        let protected = Router::new()
            .route("/api/v1/auth/users/me", get(get_me).put(update_me))
            .route("/api/v1/admin/roles", post(create_role).get(list_roles))
            .route("/api/v1/admin/roles/:id", axum::routing::delete(delete_role))
            .route("/api/v1/admin/roles/:id/permissions", post(attach_permission))
            .route(
                "/api/v1/admin/permissions",
                post(create_permission).get(list_permissions),
            )
            .route(
                "/api/v1/admin/permissions/:id",
                axum::routing::delete(delete_permission),
            )
            .route("/api/v1/admin/clients", post(create_client).get(list_clients))
            .route("/api/v1/admin/clients/:id/roles", put(assign_client_roles))
            .route(
                "/api/v1/admin/clients/:id",
                axum::routing::delete(revoke_client),
            )
            .route("/api/v1/internal/grants/:user_id", get(get_grants))
            .layer(auth_layer);

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
