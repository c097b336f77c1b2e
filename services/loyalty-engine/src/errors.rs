use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use loyalty_core::Error as LedgerError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Login already taken: {0}")]
    LoginTaken(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let message = if status_code == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidOrderNumber { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                LedgerError::OrderOwnedByAnotherUser { .. } => StatusCode::CONFLICT,
                LedgerError::DuplicateOrder { .. } => StatusCode::CONFLICT,
                LedgerError::OrderNumberReused { .. } => StatusCode::CONFLICT,
                LedgerError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                LedgerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
                LedgerError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::LoginTaken(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ApiError {
    pub fn error_type(&self) -> &str {
        match self {
            ApiError::Ledger(err) => match err {
                LedgerError::InvalidOrderNumber { .. } => "invalid_order_number",
                LedgerError::OrderOwnedByAnotherUser { .. } => "order_conflict",
                LedgerError::DuplicateOrder { .. } => "order_conflict",
                LedgerError::OrderNumberReused { .. } => "order_number_reused",
                LedgerError::InsufficientFunds { .. } => "insufficient_funds",
                LedgerError::InvalidAmount(_) => "validation_error",
                LedgerError::OrderNotFound(_) => "not_found",
                LedgerError::Storage(_) => "storage_error",
            },
            ApiError::Database(_) => "database_error",
            ApiError::BadRequest(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::LoginTaken(_) => "duplicate_error",
            ApiError::Internal(_) => "internal_error",
        }
    }
}
