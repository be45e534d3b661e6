use std::time::Duration;

use thiserror::Error;

use crate::db::models::Parameter;

/// Input that cannot be acted on. The control loop skips only the affected
/// parameter or device when it meets one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown device: {0:?}")]
    UnknownDevice(String),
    #[error("unknown parameter: {0:?}")]
    UnknownParameter(String),
    #[error("schedule time must be HH:MM between 00:00 and 23:59, got {0:?}")]
    InvalidScheduleTime(String),
    #[error("invalid {parameter} threshold: min {min} / max {max}")]
    InvalidBand { parameter: Parameter, min: f64, max: f64 },
    #[error("{parameter} reading is not a finite number: {value}")]
    NonFiniteReading { parameter: Parameter, value: f64 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection lost, pool exhausted or closed. Worth retrying.
    #[error("storage unavailable: {0}")]
    Transient(#[source] sqlx::Error),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }

    /// The request failed before a connection was handed out, so nothing
    /// reached the database.
    pub fn never_reached_storage(&self) -> bool {
        matches!(
            self,
            StoreError::Transient(sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(e),
            other => StoreError::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_transient());
        assert!(StoreError::Timeout(Duration::from_millis(10)).is_transient());
    }

    #[test]
    fn row_errors_are_not_transient() {
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
        let e = StoreError::from(ValidationError::UnknownDevice("x".into()));
        assert!(!e.is_transient());
    }

    #[test]
    fn only_pool_errors_never_reached_storage() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).never_reached_storage());
        assert!(StoreError::from(sqlx::Error::PoolClosed).never_reached_storage());
        assert!(!StoreError::Timeout(Duration::from_millis(10)).never_reached_storage());
        assert!(!StoreError::from(sqlx::Error::WorkerCrashed).never_reached_storage());
    }
}
