use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::store::StoreError;

#[derive(Debug)]
pub enum LedgerError {
    NotFound(String),
    AlreadyReverted(String),
    NotReversible(String),
    SpanAlreadyEnded(String),
    InvalidInput(String),
    IntegrityViolation(String),
    PartialBatchFailure { reverted: usize, failed: usize },
    Persistence(StoreError),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            LedgerError::AlreadyReverted(msg) => write!(f, "Already Reverted: {msg}"),
            LedgerError::NotReversible(msg) => write!(f, "Not Reversible: {msg}"),
            LedgerError::SpanAlreadyEnded(msg) => write!(f, "Span Already Ended: {msg}"),
            LedgerError::InvalidInput(msg) => write!(f, "Invalid Input: {msg}"),
            LedgerError::IntegrityViolation(msg) => write!(f, "Integrity Violation: {msg}"),
            LedgerError::PartialBatchFailure { reverted, failed } => {
                write!(f, "Partial Batch Failure: {reverted} reverted, {failed} failed")
            }
            LedgerError::Persistence(err) => write!(f, "Persistence Failure: {err}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Persistence(err) => Some(err),
            _ => None,
        }
    }
}

impl LedgerError {
    /// Client errors are the caller's to handle; everything else is on us.
    pub fn status(&self) -> StatusCode {
        match self {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::AlreadyReverted(_) | LedgerError::SpanAlreadyEnded(_) => {
                StatusCode::CONFLICT
            }
            LedgerError::NotReversible(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::IntegrityViolation(_)
            | LedgerError::PartialBatchFailure { .. }
            | LedgerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            LedgerError::NotFound(msg)
            | LedgerError::AlreadyReverted(msg)
            | LedgerError::NotReversible(msg)
            | LedgerError::SpanAlreadyEnded(msg)
            | LedgerError::InvalidInput(msg) => json!({ "error": msg }),
            LedgerError::IntegrityViolation(msg) => {
                tracing::error!("Integrity violation: {msg}");
                json!({ "error": "Internal server error" })
            }
            LedgerError::PartialBatchFailure { reverted, failed } => {
                tracing::error!("Batch reversal incomplete: {reverted} reverted, {failed} failed");
                json!({
                    "error": "Some actions could not be reverted",
                    "reverted": reverted,
                    "failed": failed,
                })
            }
            LedgerError::Persistence(err) => {
                tracing::error!("Persistence error: {err}");
                json!({ "error": "Internal server error" })
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Persistence(err)
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Persistence(StoreError::Database(err))
    }
}
