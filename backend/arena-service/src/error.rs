/// Error types for arena-service
///
/// Every failure the engine can surface maps onto one variant here, and each
/// variant has a fixed HTTP status so handlers can simply return `Result<T>`.
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

/// Result type for arena-service operations
pub type Result<T> = std::result::Result<T, AppError>;

/// PostgreSQL unique violation
const PG_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed input (bad vote choice, missing identity, limit out of range)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A vote collided with an existing vote on one of its identity signals
    #[error("Duplicate vote: {0}")]
    DuplicateVote(String),

    /// Battle is not active or its voting window has closed
    #[error("Battle not votable: {0}")]
    BattleNotVotable(String),

    /// Conflicting state change (double accept, short code collision)
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Store, cache, broker or scheduler temporarily unavailable
    #[error("Dependency unavailable: {0}")]
    TransientDependency(String),

    /// A transition fired against a battle that already left the expected state
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientDependency(_))
    }

    /// Stable machine-readable kind used in response bodies and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::DuplicateVote(_) => "duplicate_vote",
            AppError::BattleNotVotable(_) => "battle_not_votable",
            AppError::Conflict(_) => "conflict",
            AppError::NotFound(_) => "not_found",
            AppError::TransientDependency(_) => "dependency_unavailable",
            AppError::InconsistentState(_) => "inconsistent_state",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BattleNotVotable(_) => StatusCode::BAD_REQUEST,
            AppError::DuplicateVote(_) | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InconsistentState(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::TransientDependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();

        HttpResponse::build(status).json(serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "status": status.as_u16(),
        }))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound(err.to_string()),
            sqlx::Error::Database(db_err)
                if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION) =>
            {
                AppError::Conflict(db_err.message().to_string())
            }
            _ => AppError::TransientDependency(format!("database: {}", err)),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::TransientDependency(format!("redis: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization: {}", err))
    }
}

/// Name of the violated unique constraint, if `err` is a unique violation
pub(crate) fn unique_violation_constraint(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION) => {
            Some(db_err.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}
