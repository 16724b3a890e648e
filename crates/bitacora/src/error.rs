//! HTTP error type. Every failure reaches the client as `{"error": "..."}`
//! with a Spanish, user-facing message.

use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::error;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Usuario o contraseña incorrectos")]
    InvalidCredentials,

    #[error("Debe iniciar sesión")]
    Unauthorized,

    #[error("No tiene permisos para realizar esta acción")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("El archivo supera el tamaño máximo permitido")]
    PayloadTooLarge,

    /// Details are logged, never sent to the client
    #[error("Error interno del servidor")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidCredentials | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Invalid(message) => AppError::Validation(message),
            StoreError::DuplicateFirstVisit(_)
            | StoreError::DuplicateUsername(_)
            | StoreError::LastAdmin
            | StoreError::SelfDelete => AppError::Conflict(err.to_string()),
            StoreError::Storage(inner) => AppError::Internal(inner),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(format!("Solicitud no válida: {}", rejection.body_text()))
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge
        } else {
            AppError::Validation(format!("Carga de archivo no válida: {}", err.body_text()))
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if let AppError::Internal(inner) = &self {
            error!(error = ?inner, "Request failed");
        }

        let payload = json!({
            "error": self.to_string()
        });

        (self.status(), Json(payload)).into_response()
    }
}
