use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use classbits_types::api::ErrorBody;

use crate::workflow::WorkflowError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("siphon request has expired")]
    Expired,

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) | Self::Expired => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Workflow(e) => match e {
                WorkflowError::NotFound(_) | WorkflowError::NotOpenForVoting => StatusCode::NOT_FOUND,
                WorkflowError::Forbidden(_) => StatusCode::FORBIDDEN,
                WorkflowError::Validation(_)
                | WorkflowError::ActiveSiphonExists
                | WorkflowError::InsufficientFunds { .. }
                | WorkflowError::NotAwaitingTeacher(_) => StatusCode::BAD_REQUEST,
                WorkflowError::Conflict => StatusCode::CONFLICT,
                WorkflowError::Transfer(_) | WorkflowError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Expired => "SIPHON_EXPIRED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Workflow(e) => match e {
                WorkflowError::NotFound(_) => "NOT_FOUND",
                WorkflowError::Forbidden(_) => "FORBIDDEN",
                WorkflowError::Validation(_) => "VALIDATION_ERROR",
                WorkflowError::ActiveSiphonExists => "ACTIVE_SIPHON_EXISTS",
                WorkflowError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
                WorkflowError::NotOpenForVoting => "NOT_OPEN_FOR_VOTING",
                WorkflowError::NotAwaitingTeacher(_) => "NOT_AWAITING_TEACHER",
                WorkflowError::Transfer(_) => "TRANSFER_FAILED",
                WorkflowError::Conflict => "CONFLICT",
                WorkflowError::Db(_) => "INTERNAL_ERROR",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage details stay in the log
        let message = match &self {
            Self::Internal(_) | Self::Workflow(WorkflowError::Db(_)) => {
                error!("Request failed: {}", self);
                "internal server error".to_string()
            }
            Self::Workflow(WorkflowError::Transfer(_)) => {
                error!("Siphon transfer failed: {}", self);
                self.to_string()
            }
            _ => self.to_string(),
        };

        (
            status,
            Json(ErrorBody {
                error: self.error_code().to_string(),
                message,
            }),
        )
            .into_response()
    }
}
