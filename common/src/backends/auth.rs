use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use headers::{authorization::Bearer, Authorization, HeaderMapExt};
use http::request::Parts;
use http::{Request, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, Span};
use uuid::Uuid;

use crate::claims::{AuthError, Principal, PrincipalKind, TokenVerifier, PERMISSION_CACHE_TTL};
use crate::models::error::{ApiError, Error, ErrorKind};
use crate::models::user::GrantsResponse;

use super::cache::{CacheManagement, CacheManager};
use super::client::{ClientError, IdentityApiClient};
use super::headers::XOnBehalfOf;

/// Where user grants come from. The identity store in production, a stub in
/// tests.
#[async_trait]
pub trait GrantsSource: Send + Sync {
    async fn grants_for(&self, user_id: Uuid) -> Result<GrantsResponse, ClientError>;
}

#[async_trait]
impl GrantsSource for IdentityApiClient {
    async fn grants_for(&self, user_id: Uuid) -> Result<GrantsResponse, ClientError> {
        IdentityApiClient::grants_for(self, user_id).await
    }
}

type Grants = (HashSet<String>, HashSet<String>);

/// Shared state of the bearer authentication layer.
pub struct AuthState {
    verifier: TokenVerifier,
    grants: Arc<dyn GrantsSource>,
    cache: CacheManager<Grants>,
}

enum AuthRejection {
    Unauthenticated(AuthError),
    /// The identity store could not be reached for a grants lookup.
    Unavailable,
}

impl AuthRejection {
    fn into_response(self) -> Response {
        match self {
            AuthRejection::Unauthenticated(err) => {
                ApiError::new(err, StatusCode::UNAUTHORIZED).into_response()
            }
            AuthRejection::Unavailable => {
                ApiError::from(ErrorKind::TransientUnavailable).into_response()
            }
        }
    }
}

impl AuthState {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthRejection> {
        let verified = self
            .verifier
            .verify(token)
            .map_err(AuthRejection::Unauthenticated)?;

        match verified.kind {
            PrincipalKind::Machine => verified
                .into_machine_principal()
                .map_err(AuthRejection::Unauthenticated),
            PrincipalKind::User => {
                let sub = verified.claim.sub.clone();

                let (roles, permissions) = match self.cache.get(&sub) {
                    Some(grants) => grants,
                    None => {
                        let user_id = Uuid::parse_str(&sub).map_err(|_| {
                            AuthRejection::Unauthenticated(AuthError::InvalidToken)
                        })?;

                        let response =
                            self.grants.grants_for(user_id).await.map_err(|error| {
                                debug!(
                                    error = &error as &dyn std::error::Error,
                                    "failed to fetch user grants"
                                );
                                AuthRejection::Unavailable
                            })?;

                        let grants: Grants = (
                            response.roles.into_iter().collect(),
                            response.permissions.into_iter().collect(),
                        );
                        self.cache.insert(&sub, grants.clone(), PERMISSION_CACHE_TTL);
                        grants
                    }
                };

                verified
                    .into_user_principal(roles, permissions)
                    .map_err(AuthRejection::Unauthenticated)
            }
        }
    }
}

/// Verifies the bearer on every request and stores the resulting [`Principal`]
/// as a request extension.
///
/// The token is taken from the `Authorization` header or, for WebSocket
/// upgrades that cannot set headers, from the `?token=` query parameter. Both
/// are trusted equally.
#[derive(Clone)]
pub struct AuthLayer {
    state: Arc<AuthState>,
}

impl AuthLayer {
    pub fn new(verifier: TokenVerifier, grants: Arc<dyn GrantsSource>) -> Self {
        Self {
            state: Arc::new(AuthState {
                verifier,
                grants,
                cache: CacheManager::new(1024),
            }),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = Auth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Auth {
            inner,
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Auth<S> {
    inner: S,
    state: Arc<AuthState>,
}

impl<S> Service<Request<Body>> for Auth<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        let clone = self.inner.clone();
        // The inner service moved into the future must be the one that was
        // polled ready.
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let Some(token) = bearer_token(&req) else {
                return Ok(
                    ApiError::new("unauthenticated", StatusCode::UNAUTHORIZED).into_response()
                );
            };

            match state.authenticate(&token).await {
                Ok(principal) => {
                    req.extensions_mut().insert(principal);
                    inner.call(req).await
                }
                Err(rejection) => Ok(rejection.into_response()),
            }
        })
    }
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    if let Some(Authorization(bearer)) = req.headers().typed_get::<Authorization<Bearer>>() {
        return Some(bearer.token().trim().to_string());
    }

    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .filter(|token| !token.is_empty())
                .map(str::to_string)
        })
    })
}

/// Extract the principal stored by [`AuthLayer`], failing with 401 when the
/// route was (mis)configured without the layer.
#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| ApiError::new("unauthenticated", StatusCode::UNAUTHORIZED))?;

        // Record the subject for tracing purposes
        Span::current().record("account.id", tracing::field::display(principal.id));

        Ok(principal)
    }
}

/// The `X-On-Behalf-Of` header, parsed. Absent on most requests.
#[derive(Debug)]
pub struct OnBehalfOf(pub Option<Uuid>);

#[async_trait]
impl<S> FromRequestParts<S> for OnBehalfOf
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.typed_try_get::<XOnBehalfOf>() {
            Ok(Some(header)) => {
                let user_id = Uuid::parse_str(&header.0).map_err(|_| {
                    ApiError::new(
                        "x-on-behalf-of must be a user id",
                        StatusCode::BAD_REQUEST,
                    )
                })?;
                Ok(Self(Some(user_id)))
            }
            Ok(None) => Ok(Self(None)),
            Err(_) => Err(ApiError::new(
                "malformed x-on-behalf-of header",
                StatusCode::BAD_REQUEST,
            )),
        }
    }
}

/// Resolve the owner id a request acts as.
///
/// A machine principal carrying `X-On-Behalf-Of` pivots to that user after
/// proving it holds the `*:any` permission for the surface. Anybody else
/// sending the header is refused.
pub fn effective_owner(
    principal: &Principal,
    on_behalf_of: &OnBehalfOf,
    any_permission: &str,
) -> Result<Uuid, Error> {
    match (principal.kind, on_behalf_of.0) {
        (PrincipalKind::Machine, Some(user_id)) => {
            principal.require(any_permission)?;
            Ok(user_id)
        }
        (_, Some(_)) => Err(Error::custom(
            ErrorKind::Forbidden,
            "x-on-behalf-of is reserved for machine principals",
        )),
        (_, None) => Ok(principal.id),
    }
}

/// The ownership rule: the owner themselves, or a principal holding the
/// matching `*:any` permission.
pub fn ensure_owner(principal: &Principal, owner_id: Uuid, any_permission: &str) -> Result<(), Error> {
    if principal.id == owner_id {
        return Ok(());
    }

    principal.require(any_permission).map_err(Error::from)
}
