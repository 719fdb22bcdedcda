use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowplane_common::models::error::ApiError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing permission: {0}")]
    Forbidden(String),
    #[error("profile could not be found")]
    ProfileNotFound,
    #[error("role could not be found")]
    RoleNotFound,
    #[error("permission could not be found")]
    PermissionNotFound,
    #[error("machine client could not be found")]
    ClientNotFound,
    #[error("email is already registered")]
    EmailTaken,
    #[error("a role or permission with that name already exists")]
    NameTaken,
    #[error("a machine client with that name already exists")]
    ClientNameTaken,
    #[error("unsupported grant type")]
    UnsupportedGrantType,
    #[error("invalid client credentials")]
    InvalidClientCredentials,
    #[error("client has been revoked")]
    ClientRevoked,
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("identity provider rejected the request: {0}")]
    Provider(String),
    #[error("identity provider is unreachable")]
    ProviderUnavailable,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to hash client secret")]
    Hash,
    #[error("failed to mint token")]
    Mint(#[from] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<flowplane_common::claims::PermissionDenied> for Error {
    fn from(err: flowplane_common::claims::PermissionDenied) -> Self {
        Error::Forbidden(err.permission)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = match &self {
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ProfileNotFound
            | Error::RoleNotFound
            | Error::PermissionNotFound
            | Error::ClientNotFound => StatusCode::NOT_FOUND,
            Error::EmailTaken | Error::NameTaken | Error::ClientNameTaken => StatusCode::CONFLICT,
            Error::UnsupportedGrantType | Error::Registration(_) | Error::Provider(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::InvalidClientCredentials | Error::ClientRevoked => StatusCode::UNAUTHORIZED,
            Error::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            Error::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                StatusCode::CONFLICT
            }
            Error::Database(_) | Error::Hash | Error::Mint(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if code.is_server_error() {
            tracing::error!(
                error = &self as &dyn std::error::Error,
                "identity request error"
            );
            // Server errors only expose their category.
            return ApiError::new("internal", code).into_response();
        }

        ApiError::new(self.to_string(), code).into_response()
    }
}
