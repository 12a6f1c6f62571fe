use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CreditTrackerError>;

/// Postgres SQLSTATE for a unique constraint violation.
const PG_UNIQUE_VIOLATION: &str = "23505";
/// Postgres SQLSTATE for a detected deadlock.
const PG_DEADLOCK_DETECTED: &str = "40P01";

#[derive(Error, Debug)]
pub enum CreditTrackerError {
    #[error("invalid amount: {0}, must be positive and fit in 63 bits")]
    InvalidAmount(u64),

    #[error("amount arithmetic would overflow")]
    ArithmeticOverflow,

    #[error("insufficient credits: current {current}, required {required}")]
    InsufficientCredits { current: i64, required: i64 },

    #[error("cannot use credits while there is outstanding debt: {debt}, add credits to clear debt first")]
    OutstandingDebt { debt: i64 },

    #[error("operation already performed for this app name and reference id")]
    AlreadyPerformed,

    #[error("referenced deduction operation not found")]
    ReferencedOperationNotFound,

    #[error("a grant purchase is already in flight for this license and asset")]
    GrantAlreadyInFlight,

    #[error("burn initiation failed: {0}")]
    BurnFailed(String),

    #[error("balance still insufficient after burn")]
    BurnDidNotRestoreBalance,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("record not found")]
    NotFound,

    #[error("database deadlock detected")]
    Deadlock(#[source] sqlx::Error),

    #[error("duplicate key")]
    DuplicateKey(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("NATS error: {0}")]
    Nats(String),
}

impl CreditTrackerError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, CreditTrackerError::Deadlock(_))
    }

    pub fn is_insufficient_credits(&self) -> bool {
        matches!(self, CreditTrackerError::InsufficientCredits { .. })
    }

    fn error_type(&self) -> &str {
        match self {
            CreditTrackerError::InvalidAmount(_) => "invalid_amount",
            CreditTrackerError::ArithmeticOverflow => "arithmetic_overflow",
            CreditTrackerError::InsufficientCredits { .. } => "insufficient_credits",
            CreditTrackerError::OutstandingDebt { .. } => "outstanding_debt",
            CreditTrackerError::AlreadyPerformed => "already_performed",
            CreditTrackerError::ReferencedOperationNotFound => "referenced_operation_not_found",
            CreditTrackerError::GrantAlreadyInFlight => "grant_already_in_flight",
            CreditTrackerError::BurnFailed(_) => "burn_failed",
            CreditTrackerError::BurnDidNotRestoreBalance => "burn_did_not_restore_balance",
            CreditTrackerError::InvalidArguments(_) => "invalid_arguments",
            CreditTrackerError::Validation(_) => "validation_error",
            CreditTrackerError::Cancelled => "cancelled",
            CreditTrackerError::NotFound => "not_found",
            CreditTrackerError::Deadlock(_) => "deadlock",
            CreditTrackerError::DuplicateKey(_) => "duplicate_key",
            CreditTrackerError::Database(_) => "database_error",
            CreditTrackerError::Migrate(_) => "migration_error",
            CreditTrackerError::Nats(_) => "messaging_error",
        }
    }
}

// Classify database errors at the boundary so the retry driver and the
// ledger can match on deadlocks and duplicate keys without string parsing.
impl From<sqlx::Error> for CreditTrackerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some(PG_UNIQUE_VIOLATION) => return CreditTrackerError::DuplicateKey(err),
                Some(PG_DEADLOCK_DETECTED) => return CreditTrackerError::Deadlock(err),
                _ => {}
            }
        }
        if matches!(err, sqlx::Error::RowNotFound) {
            return CreditTrackerError::NotFound;
        }
        CreditTrackerError::Database(err)
    }
}

impl ResponseError for CreditTrackerError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CreditTrackerError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            CreditTrackerError::ArithmeticOverflow => StatusCode::BAD_REQUEST,
            CreditTrackerError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            CreditTrackerError::OutstandingDebt { .. } => StatusCode::PAYMENT_REQUIRED,
            CreditTrackerError::AlreadyPerformed => StatusCode::CONFLICT,
            CreditTrackerError::ReferencedOperationNotFound => StatusCode::NOT_FOUND,
            CreditTrackerError::GrantAlreadyInFlight => StatusCode::CONFLICT,
            CreditTrackerError::BurnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CreditTrackerError::BurnDidNotRestoreBalance => StatusCode::INTERNAL_SERVER_ERROR,
            CreditTrackerError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            CreditTrackerError::Validation(_) => StatusCode::BAD_REQUEST,
            CreditTrackerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CreditTrackerError::NotFound => StatusCode::NOT_FOUND,
            CreditTrackerError::Deadlock(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CreditTrackerError::DuplicateKey(_) => StatusCode::CONFLICT,
            CreditTrackerError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CreditTrackerError::Migrate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CreditTrackerError::Nats(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_classification() {
        let err = CreditTrackerError::Deadlock(sqlx::Error::PoolClosed);
        assert!(err.is_deadlock());

        let err = CreditTrackerError::Database(sqlx::Error::PoolClosed);
        assert!(!err.is_deadlock());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: CreditTrackerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CreditTrackerError::NotFound));
    }

    #[test]
    fn insufficient_credits_is_recoverable_by_orchestrator() {
        let err = CreditTrackerError::InsufficientCredits {
            current: 0,
            required: 1,
        };
        assert!(err.is_insufficient_credits());
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
    }
}
