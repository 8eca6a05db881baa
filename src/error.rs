use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{error, info};

use crate::endpoints::Envelope;

/// `axum`-compatible error handler.
#[derive(Error)]
pub struct Error {
    status: StatusCode,
    err: anyhow::Error,
}

impl Error {
    /// A request was rejected before any mutation because of a bad or missing field.
    pub fn bad_request(err: impl Into<anyhow::Error>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, err)
    }

    /// The caller's role or ownership does not permit the action.
    pub fn forbidden(err: impl Into<anyhow::Error>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, err)
    }

    /// A referenced record does not exist.
    pub fn not_found(what: &str) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, anyhow::anyhow!("{what} not found"))
    }

    /// A guarded state transition was already applied by someone else.
    pub fn conflict(err: impl Into<anyhow::Error>) -> Self {
        Self::with_status(StatusCode::CONFLICT, err)
    }

    pub fn unauthorized(err: impl Into<anyhow::Error>) -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, err)
    }

    pub fn with_status(status: StatusCode, err: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            err: err.into(),
        }
    }

    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        // Unique indexes back the "already exists" rules (user email, organization
        // name, feedback tuple), so a violation is the caller's fault.
        let unique = err
            .as_database_error()
            .is_some_and(|e| e.is_unique_violation());
        if unique {
            Self::bad_request(anyhow::anyhow!("record already exists"))
        } else {
            Self::from(anyhow::Error::new(err))
        }
    }
}

// Malformed bodies and query strings are validation failures, whatever status
// axum would pick for them.
impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(anyhow::anyhow!(rejection.body_text()))
    }
}

impl From<QueryRejection> for Error {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(anyhow::anyhow!(rejection.body_text()))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.status, self.err)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.err.fmt(f)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let message = if self.status.is_server_error() {
            error!("{:?}", self.err);

            // N.B: Forward out the error message to the requester if this is a debug build.
            // This is insecure for production builds, so we'll return a generic message if
            // this is a release build.
            if cfg!(debug_assertions) {
                format!("{:?}", self.err)
            } else {
                "internal server error".to_owned()
            }
        } else {
            info!(status = %self.status, "request rejected: {:#}", self.err);
            format!("{:#}", self.err)
        };

        (self.status, Json(Envelope::<()>::failure(message))).into_response()
    }
}
