use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("busy: job {holder} is already running")]
    Busy { holder: Uuid },

    #[error("job canceled")]
    Canceled,

    #[error("flow upsert conflict")]
    Conflict,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::Busy { .. } => StatusCode::CONFLICT,
            ServiceError::Canceled => StatusCode::CONFLICT,
            ServiceError::Conflict | ServiceError::StorageUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if !matches!(self, ServiceError::Validation(_) | ServiceError::NotFound) {
            let request_id = Uuid::new_v4();
            error!(%request_id, error = %self, "request failed");
        }

        let job_id = match &self {
            ServiceError::Busy { holder } => Some(*holder),
            _ => None,
        };
        let body = ErrorBody {
            detail: self.to_string(),
            job_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<diesel::result::Error> for ServiceError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => ServiceError::NotFound,
            other => ServiceError::Internal(other.into()),
        }
    }
}
