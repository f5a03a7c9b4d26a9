// Error taxonomy shared by the catalog, policy, auth, and HTTP layers.
//
// Each variant is a *kind*, not a transport detail; the mapping to HTTP
// status codes lives in the IntoResponse impl so that handlers can simply
// propagate with `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("authentication required")]
    AuthRequired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Key collision on node creation. Carries the full path of the
    /// contested node, e.g. "/a/b".
    #[error("key collision at {0}")]
    Collision(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Tree deletion was blocked because it would remove internally
    /// managed data files.
    #[error(
        "some items in this tree are internally managed; deleting the records \
         would also delete the underlying data files. Pass external_only=false \
         to delete them."
    )]
    WouldDeleteData,

    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Content negotiation failed. Carries the supported media types.
    #[error("no acceptable media type; supported: {}", .0.join(", "))]
    NotAcceptable(Vec<String>),

    #[error("unsupported media type {0}")]
    UnsupportedMediaType(String),

    #[error("unsupported query type {0}")]
    UnsupportedQueryType(&'static str),

    #[error("the catalog database has not been initialized")]
    UninitializedDatabase,

    /// Fatal at startup. The message includes the migration command.
    #[error(
        "catalog database revision {found:?} does not match required revision \
         {required}; back up the database and run `trellis init-catalog --upgrade`"
    )]
    DatabaseUpgradeNeeded {
        found: Option<String>,
        required: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = TreeError> = std::result::Result<T, E>;

/// Standard error body for HTTP API endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

impl TreeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TreeError::AuthRequired => StatusCode::UNAUTHORIZED,
            TreeError::Forbidden(_) => StatusCode::FORBIDDEN,
            TreeError::NotFound(_) => StatusCode::NOT_FOUND,
            TreeError::Collision(_) | TreeError::Conflict(_) | TreeError::WouldDeleteData => {
                StatusCode::CONFLICT
            }
            TreeError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TreeError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            TreeError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TreeError::UnsupportedQueryType(_) => StatusCode::BAD_REQUEST,
            // Startup-only kinds; if one leaks into a request it is a 500.
            TreeError::UninitializedDatabase
            | TreeError::DatabaseUpgradeNeeded { .. }
            | TreeError::Config(_)
            | TreeError::Database(_)
            | TreeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            TreeError::AuthRequired => "auth_required",
            TreeError::Forbidden(_) => "forbidden",
            TreeError::NotFound(_) => "not_found",
            TreeError::Collision(_) => "collision",
            TreeError::Conflict(_) => "conflict",
            TreeError::WouldDeleteData => "would_delete_data",
            TreeError::Unprocessable(_) => "unprocessable",
            TreeError::NotAcceptable(_) => "not_acceptable",
            TreeError::UnsupportedMediaType(_) => "unsupported_media_type",
            TreeError::UnsupportedQueryType(_) => "unsupported_query_type",
            _ => "internal_server_error",
        }
    }
}

impl IntoResponse for TreeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error while handling request");
            // Do not leak internals to the client.
            let body = ErrorBody::new("internal_server_error", "internal server error");
            return (status, Json(body)).into_response();
        }
        let body = ErrorBody::new(self.error_code(), self.to_string());
        (status, Json(body)).into_response()
    }
}
