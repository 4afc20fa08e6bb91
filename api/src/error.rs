use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use model::ModelError;
use placement::PlacementError;
use replicator::ReplicatorError;
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not leading")]
    NotLeader,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    request_id: String,
}

impl From<ReplicatorError> for ApiError {
    fn from(err: ReplicatorError) -> Self {
        let message = err.to_string();
        match err {
            ReplicatorError::NotLeader => ApiError::NotLeader,
            ReplicatorError::Stopped | ReplicatorError::NotEnoughTargets { .. } => {
                ApiError::ServiceUnavailable(message)
            }
            ReplicatorError::NoSuchNode(_) | ReplicatorError::NoSuchChunk(_) | ReplicatorError::NoSuchJob(_) => {
                ApiError::NotFound(message)
            }
            ReplicatorError::InvalidRequest(_) => ApiError::InvalidRequest(message),
            ReplicatorError::Model(err) => match err {
                ModelError::NoSuchChunk(_)
                | ModelError::NoSuchChunkList(_)
                | ModelError::NoSuchChunkView(_)
                | ModelError::NoSuchDynamicStore(_)
                | ModelError::NoSuchMedium(_)
                | ModelError::NoSuchNode(_) => ApiError::NotFound(message),
                ModelError::Io(_) | ModelError::Corruption(_) | ModelError::Serialization(_) => {
                    ApiError::InternalError(message)
                }
                _ => ApiError::InvalidRequest(message),
            },
            ReplicatorError::Placement(err) => match err {
                PlacementError::NoSuchMedium(_) | PlacementError::NoSuchNode(_) => ApiError::NotFound(message),
                PlacementError::NotEnoughTargets { .. } => ApiError::ServiceUnavailable(message),
                PlacementError::InvalidRequest(_) => ApiError::InvalidRequest(message),
            },
            ReplicatorError::QuorumQuery(_) | ReplicatorError::Forwarding(..) => ApiError::InternalError(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "InvalidRequest", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", msg),
            ApiError::NotLeader => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NotLeader",
                "This master is not leading".to_string(),
            ),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg),
        };

        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, message);
        }

        let body = ErrorBody {
            code,
            message,
            request_id: uuid::Uuid::new_v4().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
