use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::IntentStatus;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Intent error: {0}")]
    Intent(#[from] IntentError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Payment intent lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntentError {
    #[error("Payment intent not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: IntentStatus, to: IntentStatus },

    #[error("Task {0} has already been claimed")]
    TaskAlreadyClaimed(Uuid),

    #[error("Payment intent in status {0} cannot be cancelled")]
    NotCancellable(IntentStatus),
}

/// Liquidity provider quota errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Liquidity provider not found: {0}")]
    LpNotFound(String),

    #[error("Insufficient quota: required {required}, available {available}")]
    InsufficientQuota { required: String, available: String },

    #[error("Amount {amount} exceeds per-transaction quota {limit}")]
    PerTransactionExceeded { amount: String, limit: String },

    #[error("Liquidity provider {lp} does not support {platform}")]
    UnsupportedPlatform { lp: String, platform: String },

    #[error("Liquidity provider {0} is inactive")]
    Inactive(String),

    #[error("Total quota {total} is below locked quota {locked}")]
    TotalBelowLocked { total: String, locked: String },

    #[error("Liquidity provider already registered: {0}")]
    AlreadyRegistered(String),
}

/// Gateway and chain reconciliation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("External system unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("Unreconcilable external state: {0}")]
    Unreconcilable(String),

    #[error("Withdrawal not authorized: {0}")]
    WithdrawalDenied(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Intent(IntentError::NotFound(id)) => (
                StatusCode::NOT_FOUND,
                "INTENT_NOT_FOUND",
                format!("Payment intent not found: {}", id),
                None,
            ),
            AppError::Intent(IntentError::InvalidStateTransition { from, to }) => (
                StatusCode::CONFLICT,
                "INVALID_STATE_TRANSITION",
                format!("Cannot move payment intent from {} to {}", from, to),
                Some(serde_json::json!({ "from": from, "to": to })),
            ),
            AppError::Intent(IntentError::TaskAlreadyClaimed(id)) => (
                StatusCode::CONFLICT,
                "TASK_ALREADY_CLAIMED",
                format!("Task {} has already been claimed", id),
                None,
            ),
            AppError::Intent(IntentError::NotCancellable(status)) => (
                StatusCode::BAD_REQUEST,
                "NOT_CANCELLABLE",
                format!("Payment intent in status {} cannot be cancelled", status),
                Some(serde_json::json!({ "status": status })),
            ),
            AppError::Quota(QuotaError::InsufficientQuota { required, available }) => (
                StatusCode::CONFLICT,
                "INSUFFICIENT_QUOTA",
                "Liquidity provider has insufficient available quota".to_string(),
                Some(serde_json::json!({ "required": required, "available": available })),
            ),
            AppError::Quota(QuotaError::LpNotFound(wallet)) => (
                StatusCode::NOT_FOUND,
                "LP_NOT_FOUND",
                format!("Liquidity provider not found: {}", wallet),
                None,
            ),
            AppError::Quota(QuotaError::AlreadyRegistered(wallet)) => (
                StatusCode::CONFLICT,
                "LP_ALREADY_REGISTERED",
                format!("Liquidity provider already registered: {}", wallet),
                None,
            ),
            AppError::Quota(err) => (
                StatusCode::BAD_REQUEST,
                "QUOTA_REJECTED",
                err.to_string(),
                None,
            ),
            AppError::Reconcile(ReconcileError::ExternalUnavailable(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "EXTERNAL_UNAVAILABLE",
                format!("External system unavailable: {}", msg),
                None,
            ),
            AppError::Reconcile(ReconcileError::Unreconcilable(msg)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UNRECONCILABLE",
                format!("External state could not be reconciled: {}", msg),
                None,
            ),
            AppError::Reconcile(ReconcileError::WithdrawalDenied(reasons)) => (
                StatusCode::FORBIDDEN,
                "WITHDRAWAL_DENIED",
                format!("Withdrawal not authorized: {}", reasons),
                None,
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg,
                None,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg, None),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Validation(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::Reconcile(ReconcileError::ExternalUnavailable(format!(
            "HTTP request error: {}",
            error
        )))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let messages: Vec<String> = errs
                    .iter()
                    .map(|e| {
                        e.message
                            .as_ref()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| e.code.to_string())
                    })
                    .collect();
                format!("{}: {}", field, messages.join(", "))
            })
            .collect::<Vec<String>>()
            .join("; ");
        AppError::Validation(message)
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
