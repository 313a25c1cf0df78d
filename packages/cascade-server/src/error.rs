//! Server error type and its mapping onto the wire error taxonomy.
//!
//! Handlers propagate `AppError` with `?`; the dispatcher converts it to an
//! `error` event (or an error ack for sends) using [`AppError::code`].
//! Infrastructure failures deliberately collapse to `INTERNAL` on the wire —
//! clients retry idempotent operations with the same id.

use cascade_proto::ErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or invalid credential at connect time.
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    /// The operation needs a membership or role the user lacks.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Schema-invalid payload on an otherwise well-formed frame.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Referenced entity does not exist or is not visible to the user.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// The operation conflicts with the entity's current state.
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// Too many requests on a rate-limited path.
    #[error("rate limited")]
    RateLimited,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The machine-readable code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Unauthorized(_) => ErrorCode::Unauthorized,
            AppError::Forbidden(_) => ErrorCode::Forbidden,
            AppError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::RateLimited => ErrorCode::RateLimited,
            AppError::Database(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The message sent to the client. Infrastructure details stay in the
    /// logs; the wire carries a stable generic string for internal errors.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Database(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}
