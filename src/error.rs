use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ride::RideStatus;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },

    #[error("chair is not assigned to ride {0}")]
    NotAssigned(Uuid),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payment gateway unavailable: {0}")]
    PaymentUnavailable(String),

    #[error("payment history diverged: expected {expected} payments, gateway reports {actual}")]
    PaymentDiverged { expected: usize, actual: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_)
            | AppError::InvalidTransition { .. }
            | AppError::NotAssigned(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PaymentUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::PaymentDiverged { .. } | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
