use thiserror::Error;

use crate::model::{BookingId, TableId, UserId};

/// Which record a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User(UserId),
    Table(TableId),
    Booking(BookingId),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::User(id) => write!(f, "user {id}"),
            Entity::Table(id) => write!(f, "table {id}"),
            Entity::Booking(id) => write!(f, "booking {id}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(Entity),
    #[error("capacity {capacity} exceeded: {occupied} seats taken, cannot add {requested} more")]
    CapacityExceeded {
        occupied: i64,
        capacity: i32,
        requested: i32,
    },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("conflicting concurrent modification, retry")]
    ConflictRetryable,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConflictRetryable)
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::ConstraintViolation(_) => "constraint_violation",
            Error::ConflictRetryable => "conflict",
            Error::LimitExceeded(_) => "limit_exceeded",
            Error::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_carries_all_numbers() {
        let err = Error::CapacityExceeded { occupied: 3, capacity: 4, requested: 2 };
        let msg = err.to_string();
        assert!(msg.contains("capacity 4"));
        assert!(msg.contains("3 seats taken"));
        assert!(msg.contains("2 more"));
    }

    #[test]
    fn only_conflicts_retry() {
        assert!(Error::ConflictRetryable.is_retryable());
        assert!(!Error::NotFound(Entity::Table(1)).is_retryable());
        assert!(!Error::Storage("disk".into()).is_retryable());
    }
}
