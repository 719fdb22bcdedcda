use std::error::Error as StdError;
use std::fmt::{Display, Formatter};
use std::io;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;

/// The wire envelope every service uses for error responses.
#[derive(Debug, Deserialize, Serialize)]
pub struct ApiError {
    pub detail: String,
    #[serde(skip)]
    pub status_code: u16,
}

impl ApiError {
    pub fn new(detail: impl Display, status: StatusCode) -> Self {
        Self {
            detail: detail.to_string(),
            status_code: status.as_u16(),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), axum::Json(self)).into_response()
    }
}

/// The error categories of the control plane and their HTTP mapping.
#[derive(Clone, Copy, Debug, Eq, PartialEq, StrumDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    PayloadTooLarge,
    TransientUnavailable,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::TransientUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        ApiError::new(kind, kind.status())
    }
}

/// Server-side error carrying a category and an optional source.
///
/// Safe to return from axum endpoints: the [`axum::response::IntoResponse`]
/// implementation only exposes the category and the attached public message,
/// never the source chain.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(io::Error::new(
                io::ErrorKind::Other,
                message.as_ref().to_string(),
            ))),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The message shown to the caller: the custom message for client errors,
    /// the bare category otherwise.
    fn public_detail(&self) -> String {
        match (self.kind.status().is_client_error(), self.source.as_ref()) {
            (true, Some(source)) => source.to_string(),
            _ => self.kind.to_string(),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::from_kind(ErrorKind::NotFound),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::source(ErrorKind::Conflict, err)
            }
            sqlx::Error::Database(db) if db.is_check_violation() => {
                Self::source(ErrorKind::InvalidInput, err)
            }
            _ => Self::source(ErrorKind::Internal, err),
        }
    }
}

impl From<crate::claims::PermissionDenied> for Error {
    fn from(err: crate::claims::PermissionDenied) -> Self {
        Self::source(ErrorKind::Forbidden, err)
    }
}

impl From<crate::claims::AuthError> for Error {
    fn from(err: crate::claims::AuthError) -> Self {
        Self::custom(ErrorKind::Unauthenticated, err.to_string())
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        if self.kind.status().is_server_error() {
            tracing::error!(
                error = &self as &dyn StdError,
                "control plane request error"
            );
        }

        ApiError::new(self.public_detail(), self.kind.status()).into_response()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {}
