//! Error types for stewardship-node

use hyper::StatusCode;
use stewardship::StewardshipError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Stewardship(#[from] StewardshipError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Query error: {0}")]
    Query(#[from] serde_urlencoded::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Machine-readable kind for the `{error, kind}` body.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stewardship(e) => e.kind(),
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Json(_) => "invalid_json",
            Self::Query(_) => "invalid_query",
            Self::Io(_) => "io",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Stewardship(e) => match e {
                StewardshipError::NotFound(_) => StatusCode::NOT_FOUND,
                StewardshipError::VersionConflict { .. } | StewardshipError::InvalidTransition(_) => {
                    StatusCode::CONFLICT
                }
                StewardshipError::UnauthorizedSteward { .. }
                | StewardshipError::MonitoringDisabled(_) => StatusCode::FORBIDDEN,
                StewardshipError::TriggerDataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                e if e.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest(_) | Self::Json(_) | Self::Query(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
