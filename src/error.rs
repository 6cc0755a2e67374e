use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt::Display;

use crate::automation::auto_challenge::AutoChallengeError;
use crate::automation::recipes::RecipeStoreError;
use crate::automation::AutomationError;
use crate::db::BlockingDbError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden")
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "resource not found")
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal<E: Display>(error: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<diesel::result::Error> for AppError {
    fn from(value: diesel::result::Error) -> Self {
        match value {
            diesel::result::Error::NotFound => AppError::not_found(),
            _ => AppError::internal(value),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::internal(value)
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        AppError::internal(format!("background task failed: {value}"))
    }
}

impl From<AutomationError> for AppError {
    fn from(value: AutomationError) -> Self {
        match value {
            AutomationError::TicketNotFound { .. } => AppError::not_found(),
            AutomationError::IssuerUnmatched { .. }
            | AutomationError::IssuerUnsupported { .. }
            | AutomationError::MissingScript { .. }
            | AutomationError::ReasonRequired => AppError::bad_request(value.to_string()),
            other => AppError::internal(other),
        }
    }
}

impl From<BlockingDbError> for AppError {
    fn from(value: BlockingDbError) -> Self {
        AppError::internal(value)
    }
}

impl From<RecipeStoreError> for AppError {
    fn from(value: RecipeStoreError) -> Self {
        match value {
            RecipeStoreError::NotFound(_) => AppError::not_found(),
            RecipeStoreError::InvalidTransition { .. } | RecipeStoreError::NotExecutable(_) => {
                AppError::conflict(value.to_string())
            }
            RecipeStoreError::InvalidRecipe(_) => AppError::bad_request(value.to_string()),
            RecipeStoreError::Database(err) => AppError::from(err),
            RecipeStoreError::UnknownStatus(_) => AppError::internal(value),
        }
    }
}

impl From<AutoChallengeError> for AppError {
    fn from(value: AutoChallengeError) -> Self {
        match value {
            AutoChallengeError::TicketNotFound(_) => AppError::not_found(),
            AutoChallengeError::Store(err) => AppError::from(err),
            AutoChallengeError::Database(err) => AppError::from(err),
            other => AppError::internal(other),
        }
    }
}
