use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::{Router, Server};
use flowplane_common::backends::auth::{AuthLayer, GrantsSource};
use flowplane_common::backends::trace::RequestIdLayer;
use flowplane_common::claims::TokenVerifier;

use crate::dal::Dal;

mod handlers;

use handlers::*;

#[derive(Clone)]
pub struct RouterState {
    pub dal: Arc<dyn Dal>,
    /// Cap on the serialized size of a version config document.
    pub config_max_bytes: usize,
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
            .route("/api/v1/agents", post(create_agent).get(list_agents))
            .route(
                "/api/v1/agents/:agent_id",
                get(get_agent).put(update_agent).delete(archive_agent),
            )
            .route(
                "/api/v1/agents/:agent_id/versions",
                post(update_agent_config).get(list_versions),
            )
            .route("/api/v1/agents/:agent_id/versions/latest", get(latest_version))
            .route("/api/v1/agents/:agent_id/versions/:version_id", get(get_version))
            .route(
                "/api/v1/agents/:agent_id/versions/:version_id/publish",
                put(publish_version),
            )
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
