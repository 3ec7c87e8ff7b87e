use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::db::StoreConflict;
use crate::models::ValidationError;

/// Error returned by every REST handler.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{message}")]
    Conflict { message: String, code: &'static str },
    #[error(transparent)]
    Internal(anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::NotFound(format!("{} not found", what))
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(conflict) = e.downcast_ref::<StoreConflict>() {
            let code = match conflict {
                StoreConflict::DiagramNameTaken(_) => "DIAGRAM_NAME_TAKEN",
                StoreConflict::LearningPathHasDiagram(_) => "DIAGRAM_EXISTS",
            };
            return Self::Conflict {
                message: conflict.to_string(),
                code,
            };
        }
        if let Some(invalid) = e.downcast_ref::<ValidationError>() {
            return Self::BadRequest(invalid.to_string());
        }
        Self::Internal(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code) = match &self {
            Self::Internal(e) => {
                // Full error stays in the logs; clients get a generic message.
                tracing::error!(error = %format!("{:#}", e), "Internal error");
                ("Internal server error".to_string(), None)
            }
            Self::Conflict { message, code } => (message.clone(), Some(*code)),
            Self::BadRequest(m) => {
                tracing::warn!(message = %m, "Validation error");
                (m.clone(), Some("VALIDATION_ERROR"))
            }
            Self::Unauthorized(m) | Self::Forbidden(m) | Self::NotFound(m) => (m.clone(), None),
        };

        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("Error"),
            message: Some(message),
            code,
        };
        (status, Json(body)).into_response()
    }
}

/// `Json` extractor whose rejections use the API error body.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);
